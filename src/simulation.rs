use async_stream::stream;
use chrono::{DateTime, Local};
use colored::*;
use cseq_core::{Csn, CsnGenerator, DomainId, ReplicaId};
use cseq_indexer::{
    ChangeNumberIndexer, ChangelogError, ChangelogState, IndexerConfigBuilder, IndexerError,
    IndexerStatus, MemoryChangeNumberIndexDb, MemoryReplicaDb,
};
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error(transparent)]
    Changelog(#[from] ChangelogError),

    #[error("producer task failed: {0}")]
    Producer(String),

    #[error("index verification failed: {0}")]
    Verification(String),
}

/// Simulation parameters.
#[derive(Clone, Debug)]
pub struct SimulationParams {
    pub replicas: usize,
    pub domains: usize,
    pub updates: usize,
    /// The first replica goes offline after this many updates.
    pub offline_after: Option<usize>,
    pub max_records_per_cycle: usize,
}

/// Statistics collected during a simulation run.
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub replicas: usize,
    pub domains: usize,
    pub published: usize,
    pub indexed: usize,
    pub last_change_number: u64,
    pub offline_replicas: usize,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub total_time: Duration,
    pub changes_per_second: f64,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Change Number Index Simulation                ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Replicas:                  {:>30} ║", self.replicas);
        println!("║  Domains:                   {:>30} ║", self.domains);
        println!("║  Offline Replicas:          {:>30} ║", self.offline_replicas);
        println!("║  Published Changes:         {:>30} ║", self.published);
        println!("║  Indexed Changes:           {:>30} ║", self.indexed);
        println!("║  Last Change Number:        {:>30} ║", self.last_change_number);
        println!("║  Started:                   {:>30} ║", self.started_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string());
        println!("║  Finished:                  {:>30} ║", self.finished_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string());
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Changes/Second:            {:>30.0} ║", self.changes_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
        if self.indexed == self.published {
            println!("{}", "✓ every published change indexed exactly once, in CSN order".green());
        }
    }
}

/// Domain index for each update a replica produces.
fn update_stream(domains: usize, updates: usize) -> impl Stream<Item = usize> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..updates {
            yield rng.gen_range(0..domains);
        }
    }
}

/// What one producer published.
struct ProducerReport {
    published: Vec<(DomainId, Csn)>,
    went_offline: bool,
}

struct Replica {
    id: ReplicaId,
    generator: Arc<CsnGenerator>,
}

async fn produce(
    replica: &Replica,
    peers: Vec<Arc<CsnGenerator>>,
    domains: Arc<Vec<DomainId>>,
    updates: usize,
    offline_after: Option<usize>,
    replica_db: Arc<MemoryReplicaDb>,
    indexer: Arc<ChangeNumberIndexer>,
) -> Result<ProducerReport, ChangelogError> {
    let limit = offline_after.map_or(updates, |k| k.min(updates));
    let mut stream = Box::pin(update_stream(domains.len(), limit));
    let mut published = Vec::with_capacity(limit);
    let mut rng = StdRng::from_entropy();

    while let Some(index) = stream.next().await {
        let domain = &domains[index];
        let csn = replica.generator.new_csn();
        replica_db.append(domain, csn)?;
        indexer.publish_update_msg(domain, csn);
        published.push((domain.clone(), csn));

        // Replication delivers the change to a peer, which moves its clock.
        if !peers.is_empty() {
            peers[rng.gen_range(0..peers.len())].adjust(&csn);
        }
        if published.len() % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let went_offline = offline_after.is_some();
    if went_offline {
        let csn = replica.generator.new_csn();
        for domain in domains.iter() {
            indexer.replica_offline(domain, replica.id, csn);
        }
        info!(replica = %replica.id, %csn, "replica went offline");
    }
    Ok(ProducerReport {
        published,
        went_offline,
    })
}

pub async fn run_simulation(params: SimulationParams) -> Result<SimulationStats, SimulationError> {
    if params.replicas == 0 || params.domains == 0 {
        return Err(SimulationError::InvalidParameters(
            "at least one replica and one domain are required".to_string(),
        ));
    }

    let started_at = Local::now();
    let start = Instant::now();

    let domains = (0..params.domains)
        .map(|i| DomainId::new(format!("dc=domain{},dc=example,dc=com", i)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SimulationError::InvalidParameters(e.to_string()))?;
    let domains = Arc::new(domains);

    let replicas: Vec<Replica> = (1..=params.replicas as u32)
        .map(|rid| Replica {
            id: ReplicaId(rid),
            generator: Arc::new(CsnGenerator::new(ReplicaId(rid))),
        })
        .collect();

    let mut changelog = ChangelogState::new();
    for domain in domains.iter() {
        for replica in &replicas {
            changelog.register_replica(domain.clone(), replica.id);
        }
    }

    let config = IndexerConfigBuilder::new()
        .name("simulation")
        .max_records_per_cycle(params.max_records_per_cycle)
        .build();
    let replica_db = Arc::new(MemoryReplicaDb::new());
    let index_db = Arc::new(MemoryChangeNumberIndexDb::new());
    let indexer = Arc::new(ChangeNumberIndexer::start(
        config,
        replica_db.clone(),
        index_db.clone(),
        changelog,
    )?);

    let mut handles = Vec::with_capacity(replicas.len());
    for (idx, replica) in replicas.iter().enumerate() {
        let replica = Replica {
            id: replica.id,
            generator: replica.generator.clone(),
        };
        let peers: Vec<Arc<CsnGenerator>> = replicas
            .iter()
            .filter(|r| r.id != replica.id)
            .map(|r| r.generator.clone())
            .collect();
        let offline_after = if idx == 0 { params.offline_after } else { None };
        let domains = domains.clone();
        let replica_db = replica_db.clone();
        let indexer = indexer.clone();
        let updates = params.updates;
        handles.push(tokio::spawn(async move {
            produce(
                &replica,
                peers,
                domains,
                updates,
                offline_after,
                replica_db,
                indexer,
            )
            .await
        }));
    }

    let mut published = Vec::new();
    let mut offline = BTreeSet::new();
    for (idx, handle) in handles.into_iter().enumerate() {
        let report = handle
            .await
            .map_err(|e| SimulationError::Producer(e.to_string()))??;
        if report.went_offline {
            offline.insert(replicas[idx].id);
        }
        published.extend(report.published);
    }

    // Final heartbeats move every live replica past everything published.
    if let Some(newest) = published.iter().map(|(_, csn)| *csn).max() {
        for replica in replicas.iter().filter(|r| !offline.contains(&r.id)) {
            replica.generator.adjust(&newest);
            let heartbeat = replica.generator.new_csn();
            for domain in domains.iter() {
                indexer.publish_heartbeat(domain, replica.id, heartbeat);
            }
            debug!(replica = %replica.id, csn = %heartbeat, "final heartbeat");
        }
    }

    let status = indexer.wait_until_idle().await;
    if let IndexerStatus::Failed(reason) = status {
        return Err(SimulationError::Indexer(IndexerError::WorkerFailed(reason)));
    }

    let indexed = verify_index(&index_db, &published)?;
    let last_change_number = indexer.last_change_number();
    indexer.shutdown().await?;

    let total_time = start.elapsed();
    Ok(SimulationStats {
        replicas: params.replicas,
        domains: params.domains,
        published: published.len(),
        indexed,
        last_change_number,
        offline_replicas: offline.len(),
        started_at,
        finished_at: Local::now(),
        total_time,
        changes_per_second: published.len() as f64 / total_time.as_secs_f64(),
    })
}

/// Check that change numbers are gap-free, CSNs strictly increase and
/// every published change appears exactly once.
fn verify_index(
    index_db: &MemoryChangeNumberIndexDb,
    published: &[(DomainId, Csn)],
) -> Result<usize, SimulationError> {
    let records = index_db.records()?;

    let mut previous: Option<Csn> = None;
    for (position, record) in records.iter().enumerate() {
        let expected = position as u64 + 1;
        if record.change_number != expected {
            return Err(SimulationError::Verification(format!(
                "expected change number {}, found {}",
                expected, record.change_number
            )));
        }
        if let Some(previous) = previous {
            if record.csn <= previous {
                return Err(SimulationError::Verification(format!(
                    "change number {} has CSN {} not after {}",
                    record.change_number, record.csn, previous
                )));
            }
        }
        previous = Some(record.csn);
    }

    let indexed: BTreeSet<(DomainId, Csn)> = records
        .iter()
        .map(|r| (r.domain.clone(), r.csn))
        .collect();
    let expected: BTreeSet<(DomainId, Csn)> = published.iter().cloned().collect();
    if indexed != expected {
        let missing = expected.difference(&indexed).count();
        let unexpected = indexed.difference(&expected).count();
        return Err(SimulationError::Verification(format!(
            "{} published changes missing from the index, {} unexpected",
            missing, unexpected
        )));
    }
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulation_indexes_everything() {
        let stats = run_simulation(SimulationParams {
            replicas: 3,
            domains: 2,
            updates: 40,
            offline_after: None,
            max_records_per_cycle: 16,
        })
        .await
        .unwrap();

        assert_eq!(stats.published, 120);
        assert_eq!(stats.indexed, 120);
        assert_eq!(stats.last_change_number, 120);
    }

    #[tokio::test]
    async fn test_simulation_with_offline_replica() {
        let stats = run_simulation(SimulationParams {
            replicas: 3,
            domains: 2,
            updates: 30,
            offline_after: Some(10),
            max_records_per_cycle: 1000,
        })
        .await
        .unwrap();

        assert_eq!(stats.offline_replicas, 1);
        assert_eq!(stats.published, 70);
        assert_eq!(stats.indexed, 70);
    }

    #[tokio::test]
    async fn test_simulation_rejects_empty_topology() {
        let result = run_simulation(SimulationParams {
            replicas: 0,
            domains: 1,
            updates: 1,
            offline_after: None,
            max_records_per_cycle: 1,
        })
        .await;
        assert!(matches!(result, Err(SimulationError::InvalidParameters(_))));
    }
}
