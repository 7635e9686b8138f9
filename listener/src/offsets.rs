use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::AckMode;
use crate::types::Partition;

/// In-memory offset bookkeeping for one consumer. All offsets stored here are
/// "next to fetch" positions, i.e. handled offset + 1.
///
/// Owned by the consumer thread; never shared.
#[derive(Debug)]
pub struct OffsetLedger {
    /// Highest uncommitted commit-offset per partition.
    pending: HashMap<Partition, i64>,
    /// Most recent successful commit per partition, for transactional
    /// offset re-sends.
    last_commits: HashMap<Partition, i64>,
    /// Consumer positions snapshotted right before handler invocation, to
    /// detect seeks that happened during handling.
    saved_positions: HashMap<Partition, i64>,
    /// Commits that failed mid-rebalance, re-attempted once the assignment
    /// stabilizes.
    retained_for_rebalance: HashMap<Partition, i64>,
    /// Records handled since the last commit, for `AckMode::Count*`.
    count_since_commit: u32,
    /// When the current commit window opened, for `AckMode::Time*`.
    window_opened_at: Instant,
}

impl Default for OffsetLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            last_commits: HashMap::new(),
            saved_positions: HashMap::new(),
            retained_for_rebalance: HashMap::new(),
            count_since_commit: 0,
            window_opened_at: Instant::now(),
        }
    }

    /// Records a commit-offset for a handled record. Regressions are dropped:
    /// within one assignment epoch the committed offset never moves backwards.
    /// An intentional rewind must go through [`OffsetLedger::forget`] first
    /// (the seek path does).
    pub fn add_pending(&mut self, partition: Partition, next_offset: i64) {
        self.count_since_commit += 1;
        let slot = self.pending.entry(partition).or_insert(next_offset);
        if *slot < next_offset {
            *slot = next_offset;
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_for(&self, partition: &Partition) -> Option<i64> {
        self.pending.get(partition).copied()
    }

    /// Hands out everything that should be committed and resets the
    /// count/time window. The caller owns getting the commit onto the broker
    /// (or retaining it across a rebalance).
    pub fn take_pending(&mut self) -> HashMap<Partition, i64> {
        self.count_since_commit = 0;
        self.window_opened_at = Instant::now();
        std::mem::take(&mut self.pending)
    }

    /// Whether the active ack mode wants a commit now. `Manual` commits on
    /// every drained ack, `Record` commits inline, so both behave like
    /// `Batch` here.
    pub fn should_commit(&self, ack_mode: AckMode, ack_count: u32, ack_time: Duration) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        match ack_mode {
            AckMode::Record | AckMode::Batch | AckMode::Manual | AckMode::ManualImmediate => true,
            AckMode::Time => self.window_opened_at.elapsed() >= ack_time,
            AckMode::Count => self.count_since_commit >= ack_count,
            AckMode::CountTime => {
                self.count_since_commit >= ack_count || self.window_opened_at.elapsed() >= ack_time
            }
        }
    }

    pub fn record_committed(&mut self, commits: &HashMap<Partition, i64>) {
        for (partition, offset) in commits {
            self.last_commits.insert(partition.clone(), *offset);
        }
    }

    pub fn last_committed(&self, partition: &Partition) -> Option<i64> {
        self.last_commits.get(partition).copied()
    }

    pub fn last_commits(&self) -> &HashMap<Partition, i64> {
        &self.last_commits
    }

    pub fn save_position(&mut self, partition: Partition, position: i64) {
        self.saved_positions.insert(partition, position);
    }

    pub fn saved_position(&self, partition: &Partition) -> Option<i64> {
        self.saved_positions.get(partition).copied()
    }

    /// Parks commits that could not land because a rebalance was in
    /// progress.
    pub fn retain_for_rebalance(&mut self, commits: HashMap<Partition, i64>) {
        for (partition, offset) in commits {
            let slot = self.retained_for_rebalance.entry(partition).or_insert(offset);
            if *slot < offset {
                *slot = offset;
            }
        }
    }

    /// Takes the parked commits that belong to still-owned partitions;
    /// commits for partitions we lost are dropped (their new owner will
    /// re-process).
    pub fn take_retained(&mut self, owned: impl Fn(&Partition) -> bool) -> HashMap<Partition, i64> {
        let retained = std::mem::take(&mut self.retained_for_rebalance);
        let (keep, lost): (HashMap<_, _>, HashMap<_, _>) =
            retained.into_iter().partition(|(p, _)| owned(p));
        for partition in lost.keys() {
            tracing::debug!(%partition, "dropping retained commit for no longer owned partition");
        }
        keep
    }

    pub fn has_retained(&self) -> bool {
        !self.retained_for_rebalance.is_empty()
    }

    /// Drops per-partition state ahead of an intentional rewind (seek or
    /// nack replay); the monotonic guard only holds within one epoch.
    pub fn forget(&mut self, partition: &Partition) {
        self.pending.remove(partition);
        self.saved_positions.remove(partition);
    }

    /// Scrubs everything belonging to revoked partitions.
    pub fn remove_revoked(&mut self, revoked: &[Partition]) {
        for partition in revoked {
            self.pending.remove(partition);
            self.last_commits.remove(partition);
            self.saved_positions.remove(partition);
            self.retained_for_rebalance.remove(partition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i32) -> Partition {
        Partition::new("events", n)
    }

    #[test]
    fn pending_is_monotonic_within_epoch() {
        let mut ledger = OffsetLedger::new();
        ledger.add_pending(p(0), 11);
        ledger.add_pending(p(0), 9); // regression dropped
        ledger.add_pending(p(0), 15);
        assert_eq!(ledger.pending_for(&p(0)), Some(15));

        // an explicit rewind resets the epoch
        ledger.forget(&p(0));
        ledger.add_pending(p(0), 9);
        assert_eq!(ledger.pending_for(&p(0)), Some(9));
    }

    #[test]
    fn take_pending_drains_and_resets_window() {
        let mut ledger = OffsetLedger::new();
        ledger.add_pending(p(0), 5);
        ledger.add_pending(p(1), 7);
        let drained = ledger.take_pending();
        assert_eq!(drained.len(), 2);
        assert!(!ledger.has_pending());
        assert!(!ledger.should_commit(AckMode::Batch, 1, Duration::ZERO));
    }

    #[test]
    fn count_mode_waits_for_the_window() {
        let mut ledger = OffsetLedger::new();
        ledger.add_pending(p(0), 1);
        ledger.add_pending(p(0), 2);
        assert!(!ledger.should_commit(AckMode::Count, 3, Duration::ZERO));
        ledger.add_pending(p(0), 3);
        assert!(ledger.should_commit(AckMode::Count, 3, Duration::ZERO));
    }

    #[test]
    fn time_mode_commits_once_elapsed() {
        let mut ledger = OffsetLedger::new();
        ledger.add_pending(p(0), 1);
        assert!(!ledger.should_commit(AckMode::Time, 1, Duration::from_secs(60)));
        assert!(ledger.should_commit(AckMode::Time, 1, Duration::ZERO));
        // count_time fires on either edge
        assert!(ledger.should_commit(AckMode::CountTime, 100, Duration::ZERO));
        assert!(ledger.should_commit(AckMode::CountTime, 1, Duration::from_secs(60)));
    }

    #[test]
    fn retained_commits_survive_only_for_owned_partitions() {
        let mut ledger = OffsetLedger::new();
        let mut commits = HashMap::new();
        commits.insert(p(0), 6);
        commits.insert(p(1), 9);
        ledger.retain_for_rebalance(commits);

        let still_owned = ledger.take_retained(|partition| partition.partition == 0);
        assert_eq!(still_owned.len(), 1);
        assert_eq!(still_owned.get(&p(0)), Some(&6));
        assert!(!ledger.has_retained());
    }

    #[test]
    fn revoke_scrubs_all_tables() {
        let mut ledger = OffsetLedger::new();
        ledger.add_pending(p(0), 4);
        ledger.add_pending(p(1), 2);
        let committed: HashMap<_, _> = [(p(0), 4i64)].into_iter().collect();
        ledger.record_committed(&committed);
        ledger.save_position(p(0), 4);

        ledger.remove_revoked(&[p(0)]);
        assert_eq!(ledger.pending_for(&p(0)), None);
        assert_eq!(ledger.last_committed(&p(0)), None);
        assert_eq!(ledger.saved_position(&p(0)), None);
        assert_eq!(ledger.pending_for(&p(1)), Some(2));
    }
}
