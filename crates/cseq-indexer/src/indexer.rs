//! The change number indexer.
//!
//! One worker task per indexer consumes the per-(domain, replica) CSN
//! streams, picks the oldest pending change across all of them and appends
//! it to the global change number index once the medium consistency point
//! has reached it. The worker is the only writer of the index, which is
//! what makes change numbers strictly increasing without coordination.
//!
//! Replication code talks to the worker through non-blocking
//! notifications (`publish_update_msg`, `publish_heartbeat`,
//! `replica_offline`, `add_replica`, `remove_domain`). Each one updates the
//! shared liveness state under a single lock and wakes the worker, which
//! then re-evaluates from scratch.
//!
//! ```text
//! STARTING -> RUNNING <-> WAITING -> SHUTTING_DOWN -> STOPPED
//!                 \
//!                  +-> FAILED (storage fault or panic)
//! ```

use crate::changelog::{ChangeNumberIndexDb, ChangelogState, ReplicaDb};
use crate::composite::CompositeCursor;
use crate::config::IndexerConfig;
use crate::consistency::{ConsistencyPoint, ConsistencyTracker, Verdict};
use crate::error::{ChangelogError, IndexerError};
use crate::record::ChangeNumberIndexRecord;
use cseq_core::{Csn, DomainId, MultiDomainServerState, ReplicaId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Lifecycle of the indexer worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexerStatus {
    Starting,
    Running,
    /// Idle: every notification up to `generation` has been processed and
    /// nothing more can be indexed until the next one.
    Waiting { generation: u64 },
    ShuttingDown,
    Stopped,
    Failed(String),
}

impl IndexerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IndexerStatus::Stopped | IndexerStatus::Failed(_))
    }
}

/// State shared between notifiers and the worker, guarded by one lock so
/// that a registry change is never seen half-applied.
#[derive(Default)]
struct SharedState {
    tracker: ConsistencyTracker,
    new_pairs: Vec<(DomainId, ReplicaId)>,
    removed_domains: Vec<DomainId>,
    excluded: BTreeSet<DomainId>,
    failed: BTreeSet<DomainId>,
    blocked_on: Option<(DomainId, ReplicaId)>,
    generation: u64,
}

impl SharedState {
    fn ignores(&self, domain: &DomainId) -> bool {
        self.excluded.contains(domain) || self.failed.contains(domain)
    }

    fn request_cursor(&mut self, domain: &DomainId, replica: ReplicaId) {
        self.new_pairs.push((domain.clone(), replica));
    }
}

struct Shared {
    state: Mutex<SharedState>,
    notify: Notify,
    shutdown: AtomicBool,
    cookie: MultiDomainServerState,
    last_change_number: AtomicU64,
    status_tx: watch::Sender<IndexerStatus>,
}

impl Shared {
    fn set_status(&self, status: IndexerStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Apply `change` under the lock, count it as a notification and wake
    /// the worker.
    fn notify_with(&self, change: impl FnOnce(&mut SharedState)) {
        {
            let mut state = self.state.lock();
            change(&mut state);
            state.generation += 1;
        }
        self.notify.notify_one();
    }
}

/// Handle to a running change number indexer.
pub struct ChangeNumberIndexer {
    name: String,
    shared: Arc<Shared>,
    status_rx: watch::Receiver<IndexerStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeNumberIndexer {
    /// Initialise from durable state and spawn the worker.
    ///
    /// Must be called from within a tokio runtime. An unreadable global
    /// index is fatal and returned as an error; an unreadable domain only
    /// takes that domain out of indexing.
    pub fn start(
        config: IndexerConfig,
        replica_db: Arc<dyn ReplicaDb>,
        index_db: Arc<dyn ChangeNumberIndexDb>,
        changelog_state: ChangelogState,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        let (status_tx, status_rx) = watch::channel(IndexerStatus::Starting);

        let newest = index_db
            .newest_record()
            .map_err(IndexerError::Initialization)?;
        let (last_change_number, cookie) = match &newest {
            Some(record) => (record.change_number, record.cookie_after()),
            None => (0, MultiDomainServerState::new()),
        };

        let mut state = SharedState::default();
        state.excluded.extend(config.excluded_domains.iter().cloned());
        state.excluded.extend(changelog_state.excluded_domains());

        for domain in changelog_state.domains() {
            if state.excluded.contains(&domain) {
                debug!(%domain, "domain excluded from change number indexing");
                continue;
            }
            let newest_csns = match replica_db.domain_newest_csns(&domain) {
                Ok(csns) => csns,
                Err(err) => {
                    error!(%domain, error = %err, "cannot read domain, excluding it from indexing");
                    state.failed.insert(domain);
                    continue;
                }
            };
            for replica in changelog_state.replicas(&domain) {
                state.tracker.register(&domain, replica);
            }
            for csn in newest_csns.csns() {
                state.tracker.observe(&domain, csn);
            }
            if let Some(offline) = changelog_state.offline_replicas().get(&domain) {
                for csn in offline.csns() {
                    state.tracker.mark_offline(&domain, csn);
                }
            }
        }
        state.new_pairs = state.tracker.pairs();

        info!(
            indexer = %config.name,
            last_change_number,
            cookie = %cookie,
            replicas = state.tracker.pairs().len(),
            "starting change number indexer"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            cookie,
            last_change_number: AtomicU64::new(last_change_number),
            status_tx,
        });

        let span = info_span!("indexer", name = %config.name);
        let worker = Worker {
            max_records_per_cycle: config.max_records_per_cycle,
            shared: shared.clone(),
            replica_db,
            index_db,
            cursors: CompositeCursor::new(),
            last_change_number,
            last_csn: newest.as_ref().map(|record| record.csn),
            retired: MultiDomainServerState::new(),
        };
        let handle = tokio::spawn(worker.run().instrument(span));

        Ok(Self {
            name: config.name,
            shared,
            status_rx,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A change was stored in the replica DB for `domain`.
    pub fn publish_update_msg(&self, domain: &DomainId, csn: Csn) {
        self.shared.notify_with(|state| {
            if state.ignores(domain) {
                trace!(%domain, %csn, "ignoring update for unindexed domain");
                return;
            }
            if state.tracker.observe(domain, csn) {
                state.request_cursor(domain, csn.replica_id());
            }
        });
    }

    /// A replica proved it is alive at `csn` without sending a change.
    pub fn publish_heartbeat(&self, domain: &DomainId, replica: ReplicaId, csn: Csn) {
        if csn.replica_id() != replica {
            warn!(%domain, %replica, %csn, "heartbeat CSN belongs to another replica, ignoring");
            return;
        }
        self.shared.notify_with(|state| {
            if state.ignores(domain) {
                return;
            }
            if state.tracker.observe(domain, csn) {
                state.request_cursor(domain, replica);
            }
        });
    }

    /// A replica disconnected; it stops holding back the consistency point
    /// until it speaks again after `csn`.
    pub fn replica_offline(&self, domain: &DomainId, replica: ReplicaId, csn: Csn) {
        if csn.replica_id() != replica {
            warn!(%domain, %replica, %csn, "offline CSN belongs to another replica, ignoring");
            return;
        }
        self.shared.notify_with(|state| {
            if state.ignores(domain) {
                return;
            }
            info!(%domain, %replica, %csn, "replica offline");
            if state.tracker.mark_offline(domain, csn) {
                state.request_cursor(domain, replica);
            }
        });
    }

    /// Register a replica that joined `domain`. Until it is heard from it
    /// holds back every change of its domain.
    pub fn add_replica(&self, domain: &DomainId, replica: ReplicaId) {
        self.shared.notify_with(|state| {
            if state.ignores(domain) {
                return;
            }
            if state.tracker.register(domain, replica) {
                info!(%domain, %replica, "replica registered");
                state.request_cursor(domain, replica);
            }
        });
    }

    /// Forget a domain: its cursors, liveness and cookie entry. If the
    /// domain is referenced again it resumes after what was indexed.
    pub fn remove_domain(&self, domain: &DomainId) {
        self.shared.notify_with(|state| {
            state.tracker.remove_domain(domain);
            state.new_pairs.retain(|(d, _)| d != domain);
            state.removed_domains.push(domain.clone());
            if state
                .blocked_on
                .as_ref()
                .is_some_and(|(d, _)| d == domain)
            {
                state.blocked_on = None;
            }
        });
    }

    pub fn status(&self) -> IndexerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<IndexerStatus> {
        self.status_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for_status(
        &self,
        predicate: impl FnMut(&IndexerStatus) -> bool,
    ) -> IndexerStatus {
        let mut rx = self.status_rx.clone();
        let status = match rx.wait_for(predicate).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    /// Wait until the worker has processed every notification sent so far
    /// and is idle, or has stopped.
    pub async fn wait_until_idle(&self) -> IndexerStatus {
        let target = self.shared.state.lock().generation;
        self.wait_for_status(|status| match status {
            IndexerStatus::Waiting { generation } => *generation >= target,
            other => other.is_terminal(),
        })
        .await
    }

    /// The (domain, replica) currently holding back indexing, if any.
    pub fn blocked_on(&self) -> Option<(DomainId, ReplicaId)> {
        self.shared.state.lock().blocked_on.clone()
    }

    /// The medium consistency point as of now.
    pub fn medium_consistency_point(&self) -> ConsistencyPoint {
        self.shared.state.lock().tracker.medium_consistency_point()
    }

    /// Cookie covering every change indexed so far.
    pub fn medium_consistency(&self) -> MultiDomainServerState {
        self.shared.cookie.clone()
    }

    pub fn last_change_number(&self) -> u64 {
        self.shared.last_change_number.load(Ordering::SeqCst)
    }

    pub fn failed_domains(&self) -> Vec<DomainId> {
        self.shared.state.lock().failed.iter().cloned().collect()
    }

    /// Ask the worker to stop and wait for it.
    pub async fn shutdown(&self) -> Result<(), IndexerError> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| IndexerError::WorkerFailed(e.to_string()))?;
        }
        match self.status() {
            IndexerStatus::Failed(reason) => Err(IndexerError::WorkerFailed(reason)),
            _ => Ok(()),
        }
    }
}

impl Drop for ChangeNumberIndexer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

enum CycleOutcome {
    /// Records were appended and more may follow.
    Progress,
    /// Nothing can be indexed until the next notification.
    Idle { generation: u64 },
}

struct Worker {
    max_records_per_cycle: usize,
    shared: Arc<Shared>,
    replica_db: Arc<dyn ReplicaDb>,
    index_db: Arc<dyn ChangeNumberIndexDb>,
    cursors: CompositeCursor,
    last_change_number: u64,
    /// CSN of the newest record; nothing at or before it is appended again.
    last_csn: Option<Csn>,
    /// Positions of removed domains, so a domain that comes back resumes
    /// after what was already indexed instead of replaying its streams.
    retired: MultiDomainServerState,
}

impl Worker {
    async fn run(mut self) {
        self.shared.set_status(IndexerStatus::Running);
        loop {
            if self.shutdown_requested() {
                break;
            }
            match catch_unwind(AssertUnwindSafe(|| self.run_cycle())) {
                Ok(Ok(CycleOutcome::Progress)) => tokio::task::yield_now().await,
                Ok(Ok(CycleOutcome::Idle { generation })) => {
                    if self.shutdown_requested() {
                        break;
                    }
                    self.shared.set_status(IndexerStatus::Waiting { generation });
                    self.shared.notify.notified().await;
                    self.shared.set_status(IndexerStatus::Running);
                }
                Ok(Err(err)) => {
                    error!(error = %err, "change number indexer failed");
                    self.shared.set_status(IndexerStatus::Failed(err.to_string()));
                    return;
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(%reason, "change number indexer panicked");
                    self.shared
                        .set_status(IndexerStatus::Failed(format!("worker panicked: {}", reason)));
                    return;
                }
            }
        }
        self.shared.set_status(IndexerStatus::ShuttingDown);
        info!(last_change_number = self.last_change_number, "change number indexer stopped");
        self.shared.set_status(IndexerStatus::Stopped);
    }

    fn shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    fn run_cycle(&mut self) -> Result<CycleOutcome, ChangelogError> {
        let generation = self.apply_pending_changes();
        self.refill();

        let mut appended = 0;
        while appended < self.max_records_per_cycle && !self.shutdown_requested() {
            let Some((domain, csn)) = self.cursors.peek_min() else {
                self.shared.state.lock().blocked_on = None;
                return Ok(CycleOutcome::Idle { generation });
            };
            if let Some(last) = self.last_csn.filter(|last| csn <= *last) {
                warn!(%domain, %csn, %last, "skipping change at or before the newest indexed CSN");
                self.cursors.consume(&domain, csn.replica_id());
                self.refill();
                continue;
            }
            let verdict = {
                let mut state = self.shared.state.lock();
                let verdict = state.tracker.check(&domain, &csn);
                state.blocked_on = match &verdict {
                    Verdict::Eligible => None,
                    Verdict::Blocked { domain, replica } => Some((domain.clone(), *replica)),
                };
                verdict
            };
            match verdict {
                Verdict::Eligible => {
                    self.append(domain, csn)?;
                    appended += 1;
                    self.refill();
                }
                Verdict::Blocked { domain: d, replica } => {
                    trace!(candidate = %csn, domain = %d, %replica, "waiting for replica");
                    return Ok(CycleOutcome::Idle { generation });
                }
            }
        }
        Ok(CycleOutcome::Progress)
    }

    /// Open cursors for newly referenced pairs and drop removed domains.
    /// Returns the notification generation this cycle accounts for.
    fn apply_pending_changes(&mut self) -> u64 {
        let (generation, new_pairs, removed) = {
            let mut state = self.shared.state.lock();
            (
                state.generation,
                std::mem::take(&mut state.new_pairs),
                std::mem::take(&mut state.removed_domains),
            )
        };

        for domain in removed {
            let dropped = self.cursors.remove_domain(&domain);
            if let Some(position) = self.shared.cookie.remove_domain(&domain) {
                self.retired.merge(&domain, &position);
            }
            info!(%domain, cursors = dropped, "domain removed from change number index");
        }

        for (domain, replica) in new_pairs {
            if self.cursors.contains(&domain, replica) {
                continue;
            }
            let after = self
                .shared
                .cookie
                .csn(&domain, replica)
                .max(self.retired.csn(&domain, replica));
            match self.replica_db.cursor_from(&domain, replica, after) {
                Ok(cursor) => {
                    debug!(%domain, %replica, after = ?after, "opened replica cursor");
                    self.cursors.add(domain, replica, cursor);
                }
                Err(err) => self.fail_domain(&domain, &err),
            }
        }
        generation
    }

    fn refill(&mut self) {
        for (domain, err) in self.cursors.refill() {
            self.fail_domain(&domain, &err);
        }
    }

    fn fail_domain(&mut self, domain: &DomainId, err: &ChangelogError) {
        error!(%domain, error = %err, "cannot read domain, excluding it from indexing");
        {
            let mut state = self.shared.state.lock();
            state.failed.insert(domain.clone());
            state.tracker.remove_domain(domain);
            state.new_pairs.retain(|(d, _)| d != domain);
        }
        self.cursors.remove_domain(domain);
    }

    /// Append one record. The record is fully built, preceding cookie
    /// included, before the index sees it.
    fn append(&mut self, domain: DomainId, csn: Csn) -> Result<(), ChangelogError> {
        let change_number = self.last_change_number + 1;
        let record = ChangeNumberIndexRecord::new(
            change_number,
            csn,
            domain.clone(),
            self.shared.cookie.clone(),
        );
        self.index_db.add_record(record)?;
        self.last_change_number = change_number;
        self.last_csn = Some(csn);
        self.shared
            .last_change_number
            .store(change_number, Ordering::SeqCst);
        self.shared.cookie.update(&domain, csn);
        self.cursors.consume(&domain, csn.replica_id());
        debug!(change_number, %csn, %domain, "indexed change");
        Ok(())
    }
}
