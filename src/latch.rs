//! Blocking handoff between the broker thread and waiting callers
//!
//! A [`Latch`] is an unbounded, closable queue. `put` never blocks, so the
//! broker thread can always deliver; `get` blocks the caller until an item
//! arrives, the deadline passes, or the latch is closed.

use crate::error::{ContextError, Result};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it. Every critical section in this crate leaves its data
/// consistent, so the poison flag carries no information.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The instant `timeout` from now, or `None` if it is beyond what an
/// `Instant` can represent
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

#[derive(Debug)]
struct LatchState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Thread-safe blocking queue
#[derive(Debug)]
pub struct Latch<T> {
    state: Mutex<LatchState<T>>,
    ready: Condvar,
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Latch<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState {
                queue: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue an item and wake one waiter. Items put after close are
    /// dropped.
    pub fn put(&self, item: T) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.ready.notify_one();
    }

    /// Wait for an item
    ///
    /// Queued items are still returned after close; once drained, `get`
    /// fails with [`ContextError::ChannelClosed`]. A `None` timeout, or
    /// one too large to represent, waits forever.
    pub fn get(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.and_then(deadline_after);
        let mut state = lock(&self.state);
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(ContextError::ChannelClosed);
            }
            match deadline {
                None => {
                    state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ContextError::Timeout(timeout.unwrap_or_default()));
                    }
                    let (guard, _) = self
                        .ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }

    /// Take an item if one is ready
    pub fn try_get(&self) -> Option<T> {
        lock(&self.state).queue.pop_front()
    }

    /// Refuse further items and wake every waiter
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
