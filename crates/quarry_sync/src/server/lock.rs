//! Per-key lock bookkeeping: who holds a key, who waits for it, and in
//! which order waiters are promoted.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub(crate) type ContextId = u32;

#[derive(Debug)]
struct Holder {
    context: ContextId,
    shared: bool,
}

struct Waiter {
    context: ContextId,
    shared: bool,
    /// Fulfilled on promotion; dropped without a word when the wait is
    /// cancelled.
    grant: oneshot::Sender<()>,
}

/// State of one named lock. Either empty, exclusively held by one context,
/// or shared among several; waiters queue FIFO behind the holders.
#[derive(Default)]
struct LockState {
    holders: Vec<Holder>,
    waiters: VecDeque<Waiter>,
    /// Set when this state was removed from the table while empty. A task
    /// that cloned the entry before the removal must start over on a fresh
    /// entry instead of enqueueing into the orphan.
    retired: bool,
}

impl LockState {
    fn admits(&self, shared: bool) -> bool {
        self.holders.is_empty() || (shared && self.holders.iter().all(|holder| holder.shared))
    }
}

/// The key → lock map. Every per-key operation runs under that key's own
/// mutex and never suspends while holding it.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: DashMap<String, Arc<Mutex<LockState>>>,
}

impl LockTable {
    /// Requests `key` for `context`. Returns `None` when the lock was
    /// granted on the spot, or a receiver that resolves once a release
    /// promotes the request. Grants jump the queue only when no one is
    /// waiting; otherwise even a compatible request lines up so queued
    /// exclusive waiters cannot starve.
    pub(crate) fn lock(
        &self,
        key: &str,
        context: ContextId,
        shared: bool,
    ) -> Option<oneshot::Receiver<()>> {
        loop {
            let state = self.locks.entry(key.to_string()).or_default().clone();
            let mut state = state.lock();
            if state.retired {
                continue;
            }
            if state.waiters.is_empty() && state.admits(shared) {
                state.holders.push(Holder { context, shared });
                return None;
            }
            let (grant, granted) = oneshot::channel();
            state.waiters.push_back(Waiter {
                context,
                shared,
                grant,
            });
            return Some(granted);
        }
    }

    /// Releases whatever claim `context` has on `key`: a hold is given up,
    /// a pending wait is cancelled. Newly compatible waiters at the head of
    /// the queue are promoted; contiguous shared waiters go as a batch.
    pub(crate) fn unlock(&self, key: &str, context: ContextId) {
        let Some(state) = self.locks.get(key).map(|entry| entry.value().clone()) else {
            return;
        };
        {
            let mut state = state.lock();
            if state.retired {
                return;
            }
            state.holders.retain(|holder| holder.context != context);
            state.waiters.retain(|waiter| waiter.context != context);

            loop {
                let admitted = match state.waiters.front() {
                    Some(head) => state.admits(head.shared),
                    None => false,
                };
                if !admitted {
                    break;
                }
                if let Some(waiter) = state.waiters.pop_front() {
                    state.holders.push(Holder {
                        context: waiter.context,
                        shared: waiter.shared,
                    });
                    let _ = waiter.grant.send(());
                }
            }
        }

        // Drop the entry once it is empty. Retiring under the shard lock
        // keeps a concurrent `lock` from enqueueing into the removed state.
        self.locks.remove_if(key, |_, state| {
            let mut state = state.lock();
            if state.holders.is_empty() && state.waiters.is_empty() {
                state.retired = true;
                true
            } else {
                false
            }
        });
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::LockTable;

    #[test]
    fn shared_holders_coexist() {
        let table = LockTable::default();
        assert!(table.lock("key", 1, true).is_none());
        assert!(table.lock("key", 2, true).is_none());
    }

    #[test]
    fn exclusive_admits_nothing() {
        let table = LockTable::default();
        assert!(table.lock("key", 1, false).is_none());
        assert!(table.lock("key", 2, false).is_some());
        assert!(table.lock("key", 3, true).is_some());
    }

    #[test]
    fn exclusive_waits_for_every_shared_holder() {
        let table = LockTable::default();
        assert!(table.lock("key", 1, true).is_none());
        assert!(table.lock("key", 2, true).is_none());

        let mut granted = table.lock("key", 3, false).expect("must queue");
        table.unlock("key", 1);
        assert!(granted.try_recv().is_err(), "one shared holder remains");
        table.unlock("key", 2);
        assert!(granted.try_recv().is_ok());
    }

    #[test]
    fn queued_waiters_block_even_compatible_requests() {
        let table = LockTable::default();
        assert!(table.lock("key", 1, true).is_none());
        let _exclusive = table.lock("key", 2, false).expect("must queue");
        // shared and compatible with the holder, but it may not overtake
        // the queued exclusive request
        assert!(table.lock("key", 3, true).is_some());
    }

    #[test]
    fn contiguous_shared_waiters_promote_as_a_batch() {
        let table = LockTable::default();
        assert!(table.lock("key", 1, false).is_none());
        let mut first = table.lock("key", 2, true).expect("must queue");
        let mut second = table.lock("key", 3, true).expect("must queue");
        let mut third = table.lock("key", 4, false).expect("must queue");

        table.unlock("key", 1);
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
        assert!(third.try_recv().is_err(), "exclusive stays behind the batch");

        table.unlock("key", 2);
        assert!(third.try_recv().is_err());
        table.unlock("key", 3);
        assert!(third.try_recv().is_ok());
    }

    #[test]
    fn grants_follow_queue_order() {
        let table = LockTable::default();
        assert!(table.lock("key", 1, false).is_none());
        let mut second = table.lock("key", 2, false).expect("must queue");
        let mut third = table.lock("key", 3, false).expect("must queue");

        table.unlock("key", 1);
        assert!(second.try_recv().is_ok());
        assert!(third.try_recv().is_err());
        table.unlock("key", 2);
        assert!(third.try_recv().is_ok());
    }

    #[test]
    fn cancelled_waiter_does_not_delay_successors() {
        let table = LockTable::default();
        assert!(table.lock("key", 1, false).is_none());
        let mut cancelled = table.lock("key", 2, false).expect("must queue");
        let mut successor = table.lock("key", 3, false).expect("must queue");

        // context 2 goes away before ever being granted
        table.unlock("key", 2);
        assert!(cancelled.try_recv().is_err(), "sender must be dropped");

        table.unlock("key", 1);
        assert!(successor.try_recv().is_ok());
    }

    #[test]
    fn empty_locks_leave_the_table() {
        let table = LockTable::default();
        assert!(table.lock("key", 1, false).is_none());
        table.unlock("key", 1);
        assert!(table.is_empty());

        // a fresh cycle works after removal
        assert!(table.lock("key", 2, true).is_none());
        table.unlock("key", 2);
        assert!(table.is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let table = LockTable::default();
        assert!(table.lock("left", 1, false).is_none());
        assert!(table.lock("right", 2, false).is_none());
    }
}
