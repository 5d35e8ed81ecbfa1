use std::collections::VecDeque;
use std::time::Instant;

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::window::Window;

struct QueueState {
    windows: VecDeque<Window>,
    closed: bool,
    evicted: u64,
    /// After this instant a closed queue abandons whatever is left.
    deadline: Option<Instant>,
}

/// Bounded single-consumer FIFO of closed windows.
///
/// A full queue never blocks the producer: the oldest pending window is
/// evicted and returned to the caller so it can be logged.
pub struct ProcessingQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl ProcessingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                windows: VecDeque::with_capacity(capacity),
                closed: false,
                evicted: 0,
                deadline: None,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Windows dropped by overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }

    /// Enqueue a window. Returns the evicted window when the queue was full.
    ///
    /// Windows pushed after [`close`](Self::close) are returned unchanged.
    pub fn push(&self, window: Window) -> Option<Window> {
        let mut state = self.state.lock();
        if state.closed {
            warn!(
                "[queue] closed, refusing window {} from a late rotation",
                window.id()
            );
            return Some(window);
        }

        let evicted = if state.windows.len() >= self.capacity {
            state.evicted += 1;
            state.windows.pop_front()
        } else {
            None
        };
        state.windows.push_back(window);
        drop(state);

        self.available.notify_one();
        evicted
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<Window> {
        self.state.lock().windows.pop_front()
    }

    /// Block until a window is available.
    ///
    /// Returns `None` once the queue is closed and either empty or past its
    /// shutdown deadline. Windows left behind at the deadline are dropped and
    /// logged.
    pub fn pop(&self) -> Option<Window> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                let expired = state.deadline.is_some_and(|d| Instant::now() >= d);
                if expired && !state.windows.is_empty() {
                    let abandoned = state.windows.len();
                    state.windows.clear();
                    warn!(
                        "[queue] shutdown grace elapsed, abandoned {} unprocessed window(s)",
                        abandoned
                    );
                    return None;
                }
                return state.windows.pop_front();
            }

            if let Some(window) = state.windows.pop_front() {
                return Some(window);
            }
            self.available.wait(&mut state);
        }
    }

    /// Stop accepting windows and let the consumer drain until `deadline`.
    pub fn close(&self, deadline: Option<Instant>) {
        let mut state = self.state.lock();
        state.closed = true;
        state.deadline = deadline;
        drop(state);
        self.available.notify_all();
    }
}
