//! Global multi-producer/multi-consumer FIFO.
//!
//! Sole queue of the global-queue dispatcher and the overflow path of the
//! work-stealing dispatcher. A mutex-guarded ring with a condition variable:
//! enqueue and dequeue are linearizable, per-producer FIFO holds trivially,
//! and consumers can wait (bounded) for arrivals.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub(crate) struct JobQueue<T> {
    items: Mutex<State<T>>,
    arrival: Condvar,
}

struct State<T> {
    ring: VecDeque<T>,
    closed: bool,
}

impl<T> JobQueue<T> {
    pub(crate) fn new() -> Self {
        JobQueue {
            items: Mutex::new(State {
                ring: VecDeque::new(),
                closed: false,
            }),
            arrival: Condvar::new(),
        }
    }

    /// Appends an item and wakes one waiting consumer.
    ///
    /// Accepted even after `close`: admission control is the pool's job,
    /// and a racing submit that already passed it must not lose its item.
    pub(crate) fn enqueue(&self, item: T) {
        let mut state = self.items.lock().unwrap();
        state.ring.push_back(item);
        drop(state);
        self.arrival.notify_one();
    }

    /// Removes the oldest item, if any.
    pub(crate) fn try_dequeue(&self) -> Option<T> {
        self.items.lock().unwrap().ring.pop_front()
    }

    /// Number of queued items at the instant of the call.
    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().ring.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.lock().unwrap().ring.is_empty()
    }

    /// Blocks until an item may be available, the queue is closed, or the
    /// timeout elapses. Returns immediately if the queue is non-empty.
    pub(crate) fn wait_arrival(&self, timeout: Duration) {
        let state = self.items.lock().unwrap();
        if !state.ring.is_empty() || state.closed {
            return;
        }
        let _ = self.arrival.wait_timeout(state, timeout).unwrap();
    }

    /// Marks the queue closed and wakes every waiting consumer. One-way;
    /// called on pool cancellation so idle workers re-check exit promptly.
    pub(crate) fn close(&self) {
        let mut state = self.items.lock().unwrap();
        state.closed = true;
        drop(state);
        self.arrival.notify_all();
    }
}
