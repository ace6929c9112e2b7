//! De-duplicating, delay-capable, rate-limited work queue of run ids
//!
//! Semantics:
//! - An id is pending at most once. Adding an id that is already pending is a
//!   no-op; adding an id that is being processed marks it dirty and it is
//!   queued again when the worker calls [`WorkQueue::done`].
//! - Delayed adds wait in a heap ordered by ready time. A later add for an id
//!   with an earlier ready time wins.
//! - [`WorkQueue::add_rate_limited`] backs off exponentially per id until
//!   [`WorkQueue::forget`] resets the failure count.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use runsync_common::RetryConfig;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    /// Ready ids in FIFO order
    ready: VecDeque<String>,
    /// Ids that need processing (ready, or re-add after done)
    dirty: HashSet<String>,
    /// Ids handed to a worker and not yet done
    processing: HashSet<String>,
    /// Delayed ids keyed by (ready time, insertion order)
    waiting: BinaryHeap<Reverse<(Instant, u64, String)>>,
    /// Earliest ready time per delayed id; heap entries that disagree are stale
    waiting_at: HashMap<String, Instant>,
    failures: HashMap<String, u32>,
    seq: u64,
    shutting_down: bool,
}

impl State {
    fn add(&mut self, id: &str) {
        if self.shutting_down || self.dirty.contains(id) {
            return;
        }
        self.dirty.insert(id.to_string());
        if !self.processing.contains(id) {
            self.ready.push_back(id.to_string());
        }
    }

    fn promote_ready(&mut self, now: Instant) {
        while let Some(Reverse((at, _, _))) = self.waiting.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, _, id))) = self.waiting.pop() else {
                break;
            };
            if self.waiting_at.get(&id) == Some(&at) {
                self.waiting_at.remove(&id);
                self.add(&id);
            }
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse((at, _, _))| *at)
    }
}

/// Shared queue drained by the worker pool
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    backoff: RetryConfig,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(RetryConfig::per_item())
    }
}

impl WorkQueue {
    pub fn new(backoff: RetryConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Queue an id for immediate processing
    pub fn add(&self, id: &str) {
        self.state.lock().add(id);
        self.notify.notify_waiters();
    }

    /// Queue an id once `delay` has elapsed
    pub fn add_after(&self, id: &str, delay: Duration) {
        if delay.is_zero() {
            return self.add(id);
        }

        {
            let mut st = self.state.lock();
            if st.shutting_down {
                return;
            }
            let at = Instant::now() + delay;
            if st.waiting_at.get(id).is_some_and(|existing| *existing <= at) {
                return;
            }
            st.seq += 1;
            let seq = st.seq;
            st.waiting_at.insert(id.to_string(), at);
            st.waiting.push(Reverse((at, seq, id.to_string())));
        }
        self.notify.notify_waiters();
    }

    /// Queue an id after its per-id backoff delay
    pub fn add_rate_limited(&self, id: &str) {
        let delay = {
            let mut st = self.state.lock();
            let failures = st.failures.entry(id.to_string()).or_insert(0);
            *failures += 1;
            self.backoff.delay_for(*failures)
        };
        self.add_after(id, delay);
    }

    /// Reset an id's backoff
    pub fn forget(&self, id: &str) {
        self.state.lock().failures.remove(id);
    }

    /// Failures recorded for an id since the last [`WorkQueue::forget`]
    pub fn num_requeues(&self, id: &str) -> u32 {
        self.state.lock().failures.get(id).copied().unwrap_or(0)
    }

    /// Wait for the next ready id. Returns `None` once the queue is shut down
    /// and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready_at = {
                let mut st = self.state.lock();
                st.promote_ready(Instant::now());
                if let Some(id) = st.ready.pop_front() {
                    st.dirty.remove(&id);
                    st.processing.insert(id.clone());
                    return Some(id);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_ready_at()
            };

            match next_ready_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark an id as processed; a dirty id is queued again
    pub fn done(&self, id: &str) {
        let requeued = {
            let mut st = self.state.lock();
            st.processing.remove(id);
            if st.dirty.contains(id) && !st.shutting_down {
                st.ready.push_back(id.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Stop intake and release blocked workers
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Discard every pending, delayed and in-flight id and all backoff state.
    /// The queue keeps accepting work.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        let shutting_down = st.shutting_down;
        *st = State {
            shutting_down,
            ..State::default()
        };
    }

    /// Ids ready for a worker now
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids waiting on a delay
    pub fn delayed_len(&self) -> usize {
        self.state.lock().waiting_at.len()
    }
}
