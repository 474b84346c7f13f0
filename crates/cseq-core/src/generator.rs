//! CSN generator: the per-replica logical clock.
//!
//! Every local mutation is stamped with a CSN from the replica's generator.
//! The generator mixes wall-clock time with a sequence counter so that
//! the CSNs it hands out are strictly increasing even when the wall clock
//! stalls or jumps backward, and it folds in CSNs observed from other
//! replicas so that causally later changes always carry larger CSNs.
//!
//! `last_time` and `seq` live behind a single mutex: both operations read
//! and write the pair together.

use crate::csn::Csn;
use crate::ids::ReplicaId;
use crate::server_state::ServerState;
use crate::time::{SystemTimeSource, TimeSource};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct ClockState {
    last_time: u64,
    seq: u32,
}

/// Generates strictly increasing CSNs for one replica.
///
/// One generator exists per replica for the lifetime of the process and is
/// shared by reference (or `Arc`) with every code path that stamps changes.
pub struct CsnGenerator {
    replica_id: ReplicaId,
    time_source: Arc<dyn TimeSource>,
    state: Mutex<ClockState>,
}

impl CsnGenerator {
    /// Create a generator driven by the system clock.
    pub fn new(replica_id: ReplicaId) -> Self {
        Self::with_time_source(replica_id, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(replica_id: ReplicaId, time_source: Arc<dyn TimeSource>) -> Self {
        let now = time_source.now_millis();
        CsnGenerator {
            replica_id,
            time_source,
            state: Mutex::new(ClockState {
                last_time: now,
                seq: 0,
            }),
        }
    }

    /// Rebuild a generator after a restart from the replica's persisted
    /// state. Every CSN generated afterward is newer than all of `state`.
    pub fn from_state(
        replica_id: ReplicaId,
        time_source: Arc<dyn TimeSource>,
        state: &ServerState,
    ) -> Self {
        let generator = Self::with_time_source(replica_id, time_source);
        generator.adjust_state(state);
        generator
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Timestamp the next CSN will be at least at.
    pub fn last_time(&self) -> u64 {
        self.state.lock().last_time
    }

    /// Generate a new CSN, strictly greater than every CSN this generator
    /// produced or was adjusted with before.
    pub fn new_csn(&self) -> Csn {
        let now = self.time_source.now_millis();
        let mut state = self.state.lock();
        if now > state.last_time {
            state.last_time = now;
        }
        match state.seq.checked_add(1) {
            Some(seq) => state.seq = seq,
            None => {
                state.seq = 0;
                match state.last_time.checked_add(1) {
                    Some(t) => state.last_time = t,
                    None => tracing::warn!(
                        replica = %self.replica_id,
                        "sequence counter wrapped at the maximum timestamp, CSN order may repeat"
                    ),
                }
            }
        }
        Csn::new(state.last_time, state.seq, self.replica_id)
    }

    /// Fold an observed CSN into the clock so that the next generated CSN is
    /// strictly newer than it.
    pub fn adjust(&self, observed: &Csn) {
        let mut state = self.state.lock();
        if state.last_time <= observed.timestamp() {
            match observed.timestamp().checked_add(1) {
                Some(t) => state.last_time = t,
                None => {
                    tracing::warn!(
                        replica = %self.replica_id,
                        csn = %observed,
                        "observed CSN at the maximum timestamp, saturating the clock"
                    );
                    state.last_time = u64::MAX;
                }
            }
        }
        if observed.replica_id() == self.replica_id && state.seq < observed.seq() {
            state.seq = observed.seq();
        }
    }

    /// `adjust` every CSN of a server state.
    pub fn adjust_state(&self, server_state: &ServerState) {
        for csn in server_state.csns() {
            self.adjust(&csn);
        }
    }

    /// Resynchronise with the wall clock. The sequence counter restarts at
    /// zero only if the wall clock is ahead of the last generated time.
    pub fn adjust_to_now(&self) {
        let now = self.time_source.now_millis();
        let mut state = self.state.lock();
        if now > state.last_time {
            state.last_time = now;
            state.seq = 0;
        }
    }
}

impl std::fmt::Debug for CsnGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("CsnGenerator")
            .field("replica_id", &self.replica_id)
            .field("last_time", &state.last_time)
            .field("seq", &state.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::MAX_SEQ;
    use crate::time::ManualTimeSource;

    fn frozen(now: u64) -> Arc<ManualTimeSource> {
        Arc::new(ManualTimeSource::new(now))
    }

    #[test]
    fn test_monotonic_with_frozen_clock() {
        let gen = CsnGenerator::with_time_source(ReplicaId(1), frozen(1000));
        let mut last = gen.new_csn();
        for _ in 0..1000 {
            let next = gen.new_csn();
            assert!(next > last);
            assert_eq!(next.timestamp(), 1000);
            last = next;
        }
    }

    #[test]
    fn test_monotonic_when_clock_goes_backward() {
        let clock = frozen(1000);
        let gen = CsnGenerator::with_time_source(ReplicaId(1), clock.clone());
        let a = gen.new_csn();
        clock.set(10);
        let b = gen.new_csn();
        assert!(b > a);
        assert_eq!(b.timestamp(), 1000);
        clock.set(2000);
        let c = gen.new_csn();
        assert_eq!(c.timestamp(), 2000);
        assert!(c > b);
    }

    #[test]
    fn test_sequence_overflow_bumps_time() {
        let gen = CsnGenerator::with_time_source(ReplicaId(7), frozen(100));
        gen.adjust(&Csn::new(50, MAX_SEQ - 1, ReplicaId(7)));
        let at_max = gen.new_csn();
        assert_eq!(at_max, Csn::new(100, MAX_SEQ, ReplicaId(7)));
        let wrapped = gen.new_csn();
        assert_eq!(wrapped, Csn::new(101, 0, ReplicaId(7)));
        assert!(wrapped > at_max);
    }

    #[test]
    fn test_adjust_then_generate_is_newer() {
        let gen = CsnGenerator::with_time_source(ReplicaId(1), frozen(100));
        let remote = Csn::new(5000, 3, ReplicaId(2));
        gen.adjust(&remote);
        let next = gen.new_csn();
        assert!(next > remote);
        assert_eq!(next.timestamp(), 5001);

        // older observations do not move the clock
        gen.adjust(&Csn::new(10, 99, ReplicaId(2)));
        assert!(gen.new_csn() > next);
    }

    #[test]
    fn test_adjust_adopts_own_sequence() {
        let gen = CsnGenerator::with_time_source(ReplicaId(1), frozen(100));
        gen.adjust(&Csn::new(100, 40, ReplicaId(1)));
        let next = gen.new_csn();
        assert_eq!(next.seq(), 41);
        assert!(next > Csn::new(100, 40, ReplicaId(1)));
    }

    #[test]
    fn test_adjust_at_max_timestamp_still_progresses() {
        let gen = CsnGenerator::with_time_source(ReplicaId(1), frozen(100));
        gen.adjust(&Csn::new(u64::MAX, 5, ReplicaId(1)));
        let a = gen.new_csn();
        let b = gen.new_csn();
        assert_eq!(a.timestamp(), u64::MAX);
        assert!(a > Csn::new(u64::MAX, 5, ReplicaId(1)));
        assert!(b > a);
    }

    #[test]
    fn test_from_state_is_newer_than_state() {
        let state = ServerState::new();
        state.update(Csn::new(900, 12, ReplicaId(1)));
        state.update(Csn::new(950, 2, ReplicaId(2)));
        let gen = CsnGenerator::from_state(ReplicaId(1), frozen(100), &state);
        let next = gen.new_csn();
        assert!(state.csns().iter().all(|c| next > *c));
    }

    #[test]
    fn test_adjust_to_now_never_regresses() {
        let clock = frozen(100);
        let gen = CsnGenerator::with_time_source(ReplicaId(1), clock.clone());
        let a = gen.new_csn();
        gen.adjust_to_now();
        let b = gen.new_csn();
        assert!(b > a);
        clock.set(500);
        gen.adjust_to_now();
        let c = gen.new_csn();
        assert_eq!(c, Csn::new(500, 1, ReplicaId(1)));
    }

    #[test]
    fn test_concurrent_generation_is_unique_and_ordered() {
        let gen = Arc::new(CsnGenerator::with_time_source(ReplicaId(3), frozen(10)));
        let per_thread: Vec<Vec<Csn>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let gen = gen.clone();
                    s.spawn(move || (0..500).map(|_| gen.new_csn()).collect::<Vec<_>>())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for csns in &per_thread {
            assert!(csns.windows(2).all(|w| w[0] < w[1]));
        }
        let mut all: Vec<Csn> = per_thread.into_iter().flatten().collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
