//! Withdrawal Scheduler
//!
//! Suspend-capable queue of withdrawal opids drained one unit at a time.
//!
//! - `Single`: every push is its own unit.
//! - `Batch`: pushes accumulate into an open set which flushes once it holds
//!   `min_transactions` members or `max_wait` has passed since its first member
//!   arrived, whichever comes first.
//!
//! `stop()` closes the current generation: blocked and future pulls of that
//! generation return [`Pulled::Closed`], and unconsumed units are discarded.
//! `activate()` opens a fresh generation seeded from the store.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::ledger::Opid;

/// One execution unit: the opids delivered together to a single send
pub type Unit = BTreeSet<Opid>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Single,
    Batch {
        min_transactions: usize,
        max_wait: Duration,
    },
}

impl From<SchedulerConfig> for QueueMode {
    fn from(config: SchedulerConfig) -> Self {
        match config {
            SchedulerConfig::Single => QueueMode::Single,
            SchedulerConfig::Batch {
                min_transactions,
                max_wait_ms,
            } => QueueMode::Batch {
                min_transactions: min_transactions.max(1),
                max_wait: Duration::from_millis(max_wait_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pulled {
    Unit(Unit),
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    closed: bool,
    generation: u64,
    ready: VecDeque<Unit>,
    open: Unit,
    /// When the first member of `open` arrived
    opened_at: Option<Instant>,
}

impl QueueState {
    fn flush(&mut self) -> Unit {
        self.opened_at = None;
        std::mem::take(&mut self.open)
    }
}

pub struct WithdrawalQueue {
    mode: QueueMode,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WithdrawalQueue {
    /// Create an open queue (generation 0)
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_locked(&self, state: &mut QueueState, opid: Opid) {
        match self.mode {
            QueueMode::Single => state.ready.push_back(BTreeSet::from([opid])),
            QueueMode::Batch {
                min_transactions, ..
            } => {
                assert!(
                    !state.open.contains(&opid),
                    "withdrawal {} pushed twice into an open batch",
                    opid
                );
                if state.open.is_empty() {
                    state.opened_at = Some(Instant::now());
                }
                state.open.insert(opid);
                if state.open.len() >= min_transactions {
                    let unit = state.flush();
                    state.ready.push_back(unit);
                }
            }
        }
    }

    /// Add a withdrawal to the open unit. No-op once stopped.
    ///
    /// # Panics
    /// In `Batch` mode, if `opid` is already in the open accumulator.
    pub fn push(&self, opid: Opid) {
        {
            let mut state = self.lock();
            if state.closed {
                debug!(opid = %opid, "Queue stopped, push ignored");
                return;
            }
            self.push_locked(&mut state, opid);
        }
        self.notify.notify_waiters();
    }

    /// Next unit, suspending until one is available or the queue is stopped
    pub async fn pull(&self) -> Pulled {
        let generation = self.lock().generation;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent push is not missed
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.closed || state.generation != generation {
                    return Pulled::Closed;
                }
                if let Some(unit) = state.ready.pop_front() {
                    return Pulled::Unit(unit);
                }
                match (self.mode, state.opened_at) {
                    (QueueMode::Batch { max_wait, .. }, Some(opened_at)) => {
                        let deadline = opened_at + max_wait;
                        if Instant::now() >= deadline {
                            return Pulled::Unit(state.flush());
                        }
                        Some(deadline)
                    }
                    _ => None,
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Remove a cancelled withdrawal from queued and open units.
    ///
    /// Returns true if it was found.
    pub fn discard(&self, opid: &Opid) -> bool {
        let mut state = self.lock();
        let mut found = state.open.remove(opid);
        if found && state.open.is_empty() {
            state.opened_at = None;
        }
        for unit in state.ready.iter_mut() {
            found |= unit.remove(opid);
        }
        state.ready.retain(|unit| !unit.is_empty());
        if found {
            debug!(opid = %opid, "Withdrawal discarded from queue");
        }
        found
    }

    /// Close the current generation and discard everything not yet pulled
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let dropped = state.ready.iter().map(|u| u.len()).sum::<usize>() + state.open.len();
            state.closed = true;
            state.ready.clear();
            state.flush();
            info!(
                generation = state.generation,
                dropped, "Withdrawal queue stopped"
            );
        }
        self.notify.notify_waiters();
    }

    /// Open a fresh generation and push `pending` in order.
    ///
    /// Units of the previous generation are gone; its blocked pulls return `Closed`.
    pub fn activate(&self, pending: Vec<Opid>) -> u64 {
        let generation = {
            let mut state = self.lock();
            let generation = state.generation + 1;
            *state = QueueState {
                generation,
                ..QueueState::default()
            };
            let count = pending.len();
            for opid in pending {
                self.push_locked(&mut state, opid);
            }
            info!(generation, bootstrapped = count, "Withdrawal queue activated");
            generation
        };
        self.notify.notify_waiters();
        generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids(v: &[&str]) -> Unit {
        v.iter().map(|s| Opid::from(*s)).collect()
    }

    fn batch(min: usize, wait_ms: u64) -> WithdrawalQueue {
        WithdrawalQueue::new(QueueMode::Batch {
            min_transactions: min,
            max_wait: Duration::from_millis(wait_ms),
        })
    }

    #[tokio::test]
    async fn test_single_yields_each_push() {
        let queue = WithdrawalQueue::new(QueueMode::Single);
        queue.push(Opid::from("a"));
        queue.push(Opid::from("b"));

        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["a"])));
        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flushes_first_n_at_min_count() {
        let queue = batch(2, 60_000);
        let start = Instant::now();
        queue.push(Opid::from("a"));
        queue.push(Opid::from("b"));
        queue.push(Opid::from("c"));

        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["a", "b"])));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flushes_after_max_wait() {
        let queue = batch(5, 1_000);
        let start = Instant::now();
        queue.push(Opid::from("a"));

        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["a"])));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1_000));
        assert!(waited < Duration::from_millis(1_010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timer_starts_at_first_member() {
        let queue = Arc::new(batch(5, 1_000));
        let start = Instant::now();

        tokio::time::sleep(Duration::from_millis(300)).await;
        queue.push(Opid::from("a"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.push(Opid::from("b"));

        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["a", "b"])));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1_300));
        assert!(waited < Duration::from_millis(1_310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_pull_wakes_on_push() {
        let queue = Arc::new(WithdrawalQueue::new(QueueMode::Single));
        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(Opid::from("x"));

        assert_eq!(puller.await.unwrap(), Pulled::Unit(ids(&["x"])));
    }

    #[tokio::test]
    #[should_panic(expected = "pushed twice")]
    async fn test_duplicate_in_open_batch_panics() {
        let queue = batch(3, 1_000);
        queue.push(Opid::from("a"));
        queue.push(Opid::from("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discarded_member_can_be_pushed_again() {
        let queue = batch(2, 60_000);
        queue.push(Opid::from("a"));
        assert!(queue.discard(&Opid::from("a")));
        assert!(!queue.discard(&Opid::from("a")));

        queue.push(Opid::from("a"));
        queue.push(Opid::from("b"));
        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["a", "b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_drops_emptied_ready_unit() {
        let queue = WithdrawalQueue::new(QueueMode::Single);
        queue.push(Opid::from("a"));
        queue.push(Opid::from("b"));
        queue.discard(&Opid::from("a"));

        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_blocked_pull() {
        let queue = Arc::new(batch(3, 60_000));
        queue.push(Opid::from("a"));
        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.stop();

        assert_eq!(puller.await.unwrap(), Pulled::Closed);
        assert_eq!(queue.pull().await, Pulled::Closed);
        assert_eq!(queue.pull().await, Pulled::Closed);

        queue.push(Opid::from("b"));
        assert!(queue.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_discards_unpulled() {
        let queue = WithdrawalQueue::new(QueueMode::Single);
        queue.push(Opid::from("stale"));
        queue.stop();

        queue.activate(vec![Opid::from("fresh")]);
        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["fresh"])));

        // The discarded id is accepted again in the new generation
        queue.push(Opid::from("stale"));
        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["stale"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_reactivation_accepts_previous_member() {
        let queue = batch(2, 60_000);
        queue.push(Opid::from("a"));
        queue.stop();
        queue.activate(Vec::new());

        queue.push(Opid::from("a"));
        queue.push(Opid::from("b"));
        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["a", "b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_generation_pull_sees_closed() {
        let queue = Arc::new(WithdrawalQueue::new(QueueMode::Single));
        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.stop();
        queue.activate(vec![Opid::from("new")]);

        assert_eq!(puller.await.unwrap(), Pulled::Closed);
        assert_eq!(queue.pull().await, Pulled::Unit(ids(&["new"])));
    }

    #[test]
    fn test_mode_from_config() {
        let mode = QueueMode::from(SchedulerConfig::Batch {
            min_transactions: 2,
            max_wait_ms: 500,
        });
        assert_eq!(
            mode,
            QueueMode::Batch {
                min_transactions: 2,
                max_wait: Duration::from_millis(500)
            }
        );
        assert_eq!(QueueMode::from(SchedulerConfig::Single), QueueMode::Single);
    }
}
