//! Blocking FIFO used for hand-off between I/O and worker threads.
//!
//! The queue has two independent limits. `max_depth` bounds the number of
//! queued items: `push` blocks while the queue is full. `threshold` drives the
//! `busy` level signal that upstream components poll for flow control; it
//! never blocks anything by itself. Either limit is disabled when zero.
//!
//! `stop` is terminal: it wakes every waiter, pending and future pops return
//! [`Error::Stopped`], and pushes are refused. Worker threads use this as
//! their exit signal.

use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    max_depth: usize,
    threshold: usize,
    busy: bool,
    stopped: bool,
}

impl<T> State<T> {
    fn full(&self) -> bool {
        self.max_depth > 0 && self.items.len() >= self.max_depth
    }
}

/// Thread-safe FIFO with optional depth limit and busy threshold.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    push_cv: Condvar,
    pop_cv: Condvar,
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue. Zero disables the corresponding limit.
    pub fn new(max_depth: usize, threshold: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                max_depth,
                threshold,
                busy: false,
                stopped: false,
            }),
            push_cv: Condvar::new(),
            pop_cv: Condvar::new(),
        }
    }

    /// Change the depth limit.
    pub fn set_max_depth(&self, max_depth: usize) {
        self.state.lock().max_depth = max_depth;
        self.push_cv.notify_all();
    }

    /// Change the busy threshold.
    pub fn set_threshold(&self, threshold: usize) {
        let mut state = self.state.lock();
        state.threshold = threshold;
        state.busy = threshold > 0 && state.items.len() > threshold;
    }

    /// Append `value`, blocking while the queue is full.
    pub fn push(&self, value: T) -> Result<()> {
        let mut state = self.state.lock();
        while state.full() && !state.stopped {
            self.push_cv.wait(&mut state);
        }
        if state.stopped {
            return Err(Error::Stopped);
        }
        state.items.push_back(value);
        if state.threshold > 0 && state.items.len() > state.threshold {
            state.busy = true;
        }
        drop(state);
        self.pop_cv.notify_one();
        Ok(())
    }

    /// Remove the front item, blocking while the queue is empty.
    pub fn pop(&self) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Err(Error::Stopped);
            }
            if let Some(value) = state.items.pop_front() {
                self.after_pop(&mut state);
                drop(state);
                self.push_cv.notify_one();
                return Ok(value);
            }
            self.pop_cv.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`, returning
    /// `Ok(None)`.
    pub fn try_pop_for(&self, timeout: Duration) -> Result<Option<T>> {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if state.stopped {
                return Err(Error::Stopped);
            }
            if let Some(value) = state.items.pop_front() {
                self.after_pop(&mut state);
                drop(state);
                self.push_cv.notify_one();
                return Ok(Some(value));
            }
            if self.pop_cv.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    /// Remove the front item if there is one, without blocking.
    pub fn try_pop(&self) -> Result<Option<T>> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Stopped);
        }
        let value = state.items.pop_front();
        if value.is_some() {
            self.after_pop(&mut state);
            drop(state);
            self.push_cv.notify_one();
        }
        Ok(value)
    }

    fn after_pop(&self, state: &mut State<T>) {
        if state.items.len() <= state.threshold {
            state.busy = false;
        }
    }

    /// Drop every queued item and clear the busy flag.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.busy = false;
        drop(state);
        self.push_cv.notify_all();
    }

    /// Shut the queue down and wake every waiter.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.items.clear();
        drop(state);
        self.push_cv.notify_all();
        self.pop_cv.notify_all();
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Level signal: queue depth is above the threshold.
    pub fn busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn strict_fifo() {
        let queue = BoundedQueue::new(0, 0);
        for i in 0..10 {
            queue.push(i).unwrap();
        }
        let out: Vec<_> = (0..10).map(|_| queue.pop().unwrap()).collect();
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn busy_is_a_level_signal() {
        let queue = BoundedQueue::new(0, 2);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(!queue.busy());
        queue.push(3).unwrap();
        assert!(queue.busy());
        queue.pop().unwrap();
        assert!(!queue.busy());
    }

    #[test]
    fn push_blocks_when_full() {
        let queue = Arc::new(BoundedQueue::new(1, 0));
        queue.push(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop().unwrap(), 1);
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop().unwrap(), 2);
    }

    #[test]
    fn try_pop_times_out() {
        let queue: BoundedQueue<u8> = BoundedQueue::default();
        let start = Instant::now();
        assert_eq!(queue.try_pop_for(Duration::from_millis(10)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn stop_wakes_blocked_pop() {
        let queue: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::default());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(10));
        queue.stop();
        assert!(matches!(consumer.join().unwrap(), Err(Error::Stopped)));
        assert!(matches!(queue.push(1), Err(Error::Stopped)));
    }

    #[test]
    fn reset_clears_busy() {
        let queue = BoundedQueue::new(0, 1);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(queue.busy());
        queue.reset();
        assert!(!queue.busy());
        assert!(queue.is_empty());
    }
}
