//! Queue of messages waiting for the application.

use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::message::IncomingMessage;

#[derive(Default)]
pub(crate) struct ReleasedMessages {
    queue: SegQueue<IncomingMessage>,
    lock: Mutex<()>,
    signal: Condvar,
}

impl ReleasedMessages {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, message: IncomingMessage) {
        self.queue.push(message);
        // taken so a waiter between its empty check and wait() is not missed
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    pub(crate) fn pop(&self) -> Option<IncomingMessage> {
        self.queue.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Option<IncomingMessage> {
        if let Some(message) = self.queue.pop() {
            return Some(message);
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if let Some(message) = self.queue.pop() {
                return Some(message);
            }
            if self.signal.wait_until(&mut guard, deadline).timed_out() {
                return self.queue.pop();
            }
        }
    }

    /// Wake every blocked `wait` so it can observe shutdown.
    pub(crate) fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    pub(crate) fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}
