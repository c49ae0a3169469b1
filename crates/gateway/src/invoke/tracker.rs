//! Post-submission confirmation tracking.
//!
//! Submitted transactions are polled against the chain until they appear in a
//! block or exceed the age ceiling, at which point they move into a bounded
//! failed-history ring. A resolved hash (confirmed or failed) is never
//! tracked again, so replays of the same submission cannot resurrect it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::chain::SharedChain;

const POLL_PERIOD: Duration = Duration::from_secs(5);
const MAX_AGE: Duration = Duration::from_secs(120);
const FAILED_HISTORY_LIMIT: usize = 64;
/// Re-track protection window. Hashes older than the last this many
/// resolutions are forgotten and could be tracked again; accepted trade-off
/// to keep the tracker's memory bounded.
const RESOLVED_HISTORY_LIMIT: usize = 1024;

pub struct ConfirmationTracker {
    state: Mutex<TrackerState>,
    poll_period: Duration,
    max_age: Duration,
    failed_history: usize,
}

#[derive(Default)]
struct TrackerState {
    /// Unconfirmed hashes and how long each has been tracked.
    pending: HashMap<String, Duration>,
    /// Most recent evictions, oldest first.
    failed: VecDeque<String>,
    /// Recent hashes that left `pending`, confirmed or failed. Bounded by
    /// [`RESOLVED_HISTORY_LIMIT`], oldest forgotten first.
    resolved: HashSet<String>,
    resolved_order: VecDeque<String>,
}

impl TrackerState {
    fn remember_resolved(&mut self, tx_hash: &str) {
        if !self.resolved.insert(tx_hash.to_owned()) {
            return;
        }
        self.resolved_order.push_back(tx_hash.to_owned());
        while self.resolved_order.len() > RESOLVED_HISTORY_LIMIT {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}

/// Point-in-time view of the tracker, embedded in API responses.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackerSnapshot {
    pub pending: Vec<String>,
    pub failed: Vec<String>,
}

impl Default for ConfirmationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationTracker {
    pub fn new() -> Self {
        Self::with_limits(POLL_PERIOD, MAX_AGE, FAILED_HISTORY_LIMIT)
    }

    pub fn with_limits(poll_period: Duration, max_age: Duration, failed_history: usize) -> Self {
        ConfirmationTracker {
            state: Mutex::new(TrackerState::default()),
            poll_period,
            max_age,
            failed_history,
        }
    }

    /// Starts tracking a hash. Idempotent; hashes already pending or already
    /// resolved are left untouched.
    pub fn track(&self, tx_hash: &str) {
        let mut state = self.state.lock();
        if state.resolved.contains(tx_hash) || state.pending.contains_key(tx_hash) {
            return;
        }
        tracing::info!(%tx_hash, "tracking transaction until confirmation");
        state.pending.insert(tx_hash.to_owned(), Duration::ZERO);
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.lock();
        let mut pending: Vec<String> = state.pending.keys().cloned().collect();
        pending.sort();
        TrackerSnapshot {
            pending,
            failed: state.failed.iter().cloned().collect(),
        }
    }

    /// Background polling loop; runs until the owning task is aborted.
    pub async fn run(self: Arc<Self>, chain: SharedChain) {
        let mut interval = tokio::time::interval(self.poll_period);
        interval.tick().await;
        loop {
            interval.tick().await;
            self.poll_once(&chain).await;
        }
    }

    /// One polling round over the current pending set.
    async fn poll_once(&self, chain: &SharedChain) {
        let hashes: Vec<String> = self.state.lock().pending.keys().cloned().collect();
        for tx_hash in hashes {
            match chain.transaction_height(&tx_hash).await {
                Ok(Some(height)) => self.confirm(&tx_hash, height),
                Ok(None) => self.age(&tx_hash),
                Err(error) => {
                    // fail open: an unreachable node must not evict early,
                    // but the age still advances towards the ceiling
                    tracing::warn!(%tx_hash, %error, "confirmation poll failed");
                    self.age(&tx_hash);
                }
            }
        }
    }

    fn confirm(&self, tx_hash: &str, height: u64) {
        let mut state = self.state.lock();
        if state.pending.remove(tx_hash).is_some() {
            state.remember_resolved(tx_hash);
            tracing::info!(%tx_hash, height, "transaction confirmed");
        }
    }

    fn age(&self, tx_hash: &str) {
        let mut state = self.state.lock();
        let Some(age) = state.pending.get_mut(tx_hash) else {
            return;
        };
        *age += self.poll_period;
        if *age <= self.max_age {
            return;
        }
        state.pending.remove(tx_hash);
        state.remember_resolved(tx_hash);
        state.failed.push_back(tx_hash.to_owned());
        while state.failed.len() > self.failed_history {
            state.failed.pop_front();
        }
        tracing::warn!(%tx_hash, "transaction never confirmed, giving up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;

    fn tracker() -> ConfirmationTracker {
        ConfirmationTracker::with_limits(Duration::from_secs(5), Duration::from_secs(120), 4)
    }

    #[tokio::test]
    async fn confirmed_transaction_leaves_pending() {
        let chain = MockChain::new();
        let shared: SharedChain = Arc::new(chain.clone());
        let tracker = tracker();

        tracker.track("tx1");
        assert_eq!(tracker.snapshot().pending, vec!["tx1"]);

        tracker.poll_once(&shared).await;
        assert_eq!(tracker.snapshot().pending, vec!["tx1"]);

        chain.confirm_tx("tx1", 77);
        tracker.poll_once(&shared).await;
        let snapshot = tracker.snapshot();
        assert!(snapshot.pending.is_empty());
        assert!(snapshot.failed.is_empty());
    }

    #[tokio::test]
    async fn unconfirmed_transaction_fails_after_age_ceiling() {
        let chain = MockChain::new();
        let shared: SharedChain = Arc::new(chain);
        let tracker = tracker();
        tracker.track("tx1");

        // 120s ceiling at 5s per poll: eviction happens on the 25th round
        for _ in 0..24 {
            tracker.poll_once(&shared).await;
            assert_eq!(tracker.snapshot().pending, vec!["tx1"]);
        }
        tracker.poll_once(&shared).await;
        let snapshot = tracker.snapshot();
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.failed, vec!["tx1"]);
    }

    #[tokio::test]
    async fn resolved_hashes_are_never_retracked() {
        let chain = MockChain::new();
        let shared: SharedChain = Arc::new(chain.clone());
        let tracker = tracker();

        chain.confirm_tx("tx1", 1);
        tracker.track("tx1");
        tracker.poll_once(&shared).await;
        assert!(tracker.snapshot().pending.is_empty());

        tracker.track("tx1");
        assert!(tracker.snapshot().pending.is_empty());
    }

    #[tokio::test]
    async fn track_is_idempotent_while_pending() {
        let tracker = tracker();
        tracker.track("tx1");
        tracker.track("tx1");
        assert_eq!(tracker.snapshot().pending, vec!["tx1"]);
    }

    #[tokio::test]
    async fn failed_history_is_bounded() {
        let chain = MockChain::new();
        let shared: SharedChain = Arc::new(chain);
        let tracker = ConfirmationTracker::with_limits(
            Duration::from_secs(5),
            Duration::from_secs(0),
            2,
        );

        for hash in ["a", "b", "c"] {
            tracker.track(hash);
            tracker.poll_once(&shared).await;
        }
        assert_eq!(tracker.snapshot().failed, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn resolved_memory_stays_bounded() {
        let chain = MockChain::new();
        let shared: SharedChain = Arc::new(chain.clone());
        let tracker = tracker();

        // resolve one hash per poll so the eviction order is the tx order
        let total = RESOLVED_HISTORY_LIMIT + 100;
        for i in 0..total {
            let hash = format!("tx{i}");
            tracker.track(&hash);
            chain.confirm_tx(&hash, i as u64);
            tracker.poll_once(&shared).await;
        }
        assert!(tracker.snapshot().pending.is_empty());

        {
            let state = tracker.state.lock();
            assert_eq!(state.resolved.len(), RESOLVED_HISTORY_LIMIT);
            assert_eq!(state.resolved_order.len(), RESOLVED_HISTORY_LIMIT);
        }

        // recent resolutions are still protected from re-tracking, the
        // forgotten oldest ones no longer are
        tracker.track(&format!("tx{}", total - 1));
        assert!(tracker.snapshot().pending.is_empty());
        tracker.track("tx0");
        assert_eq!(tracker.snapshot().pending, vec!["tx0"]);
    }

    #[tokio::test]
    async fn poll_errors_do_not_evict_before_the_ceiling() {
        let chain = MockChain::new();
        chain.fail_tx_height(true);
        let shared: SharedChain = Arc::new(chain);
        let tracker = tracker();
        tracker.track("tx1");

        tracker.poll_once(&shared).await;
        assert_eq!(tracker.snapshot().pending, vec!["tx1"]);
    }
}
