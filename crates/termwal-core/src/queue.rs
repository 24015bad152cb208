//! Bounded multi-producer queue feeding the writer thread
//!
//! Producers block in `put` while the queue is full. Every operation that
//! frees space (`drain_into`, `clear`) or ends the queue (`close`) signals
//! `not_full`, so no producer can be left waiting on a queue that has room.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue, blocking while full. Hands the item back if the queue is closed.
    pub fn put(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Move up to `max` items into `out`, waiting at most `timeout` for the first one.
    /// Returns the number moved.
    pub fn drain_into(&self, out: &mut Vec<T>, max: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.closed {
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        let n = state.items.len().min(max);
        out.extend(state.items.drain(..n));
        drop(state);
        if n > 0 {
            self.not_full.notify_all();
        }
        n
    }

    /// Drop every queued item and wake all blocked producers. Returns the count dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.items.len();
        state.items.clear();
        drop(state);
        // Signal unconditionally; producers may be parked even when nothing was dropped.
        self.not_full.notify_all();
        dropped
    }

    /// Refuse further puts and wake everyone. Queued items stay drainable.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
