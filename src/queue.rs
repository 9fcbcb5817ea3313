use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::frame::FrameHandle;

/// Fixed-capacity FIFO of frame handles guarded by one mutex and two
/// condition variables. Capacity is enforced by blocking, never by error;
/// every wait re-checks its predicate in a loop.
pub struct FrameQueue {
    capacity: usize,
    list: Mutex<VecDeque<FrameHandle>>,
    /// Signalled when the queue becomes non-empty.
    fill: Condvar,
    /// Signalled when the queue becomes non-full.
    room: Condvar,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            list: Mutex::new(VecDeque::with_capacity(capacity)),
            fill: Condvar::new(),
            room: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocking append: waits while the queue is full, then signals "fill".
    pub fn push(&self, frame: FrameHandle) {
        let mut list = self.list.lock();
        while list.len() == self.capacity {
            self.room.wait(&mut list);
        }
        list.push_back(frame);
        self.fill.notify_all();
    }

    /// Locks the queue. Size and contents are only consistent while the
    /// returned guard is held.
    pub fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            queue: self,
            list: self.list.lock(),
        }
    }

    /// Snapshot of the current size; stale the moment it returns.
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

pub struct QueueGuard<'a> {
    queue: &'a FrameQueue,
    list: MutexGuard<'a, VecDeque<FrameHandle>>,
}

impl QueueGuard<'_> {
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }

    pub fn free(&self) -> usize {
        self.queue.capacity - self.list.len()
    }

    pub fn front(&self) -> Option<&FrameHandle> {
        self.list.front()
    }

    pub fn pop_front(&mut self) -> Option<FrameHandle> {
        self.list.pop_front()
    }

    /// Handles in queue order; clones are reference-count increments only.
    pub fn snapshot(&self) -> Vec<FrameHandle> {
        self.list.iter().cloned().collect()
    }

    /// Waits on "fill" while the queue is empty and `keep_waiting` holds.
    /// The predicate is re-evaluated after every wakeup, so a shutdown
    /// broadcast sent under this queue's lock is never missed.
    pub fn wait_fill_while(&mut self, mut keep_waiting: impl FnMut() -> bool) {
        while self.list.is_empty() && keep_waiting() {
            self.queue.fill.wait(&mut self.list);
        }
    }

    /// Waits on "fill" until at least `n` frames are queued, while
    /// `keep_waiting` holds.
    pub fn wait_len_while(&mut self, n: usize, mut keep_waiting: impl FnMut() -> bool) {
        while self.list.len() < n && keep_waiting() {
            self.queue.fill.wait(&mut self.list);
        }
    }

    /// Waits on "room" until at least `n` slots are free.
    pub fn wait_room(&mut self, n: usize) {
        while self.queue.capacity - self.list.len() < n {
            self.queue.room.wait(&mut self.list);
        }
    }

    pub fn notify_fill(&self) {
        self.queue.fill.notify_all();
    }

    pub fn notify_room(&self) {
        self.queue.room.notify_all();
    }
}

/// Moves exactly `count` frames from the front of `src` to the back of `dst`
/// in order. Both locks are held by the caller for the duration, so the move
/// is atomic with respect to every other queue operation. The caller must
/// have checked (or waited for) `src.len() >= count` and
/// `dst.free() >= count`; violating that is a programming error.
/// A `count == 0` call is a no-op and performs no signaling.
pub fn shift(dst: &mut QueueGuard<'_>, src: &mut QueueGuard<'_>, count: usize) {
    debug_assert!(src.len() >= count, "shift past source size");
    debug_assert!(dst.free() >= count, "shift past destination capacity");
    for _ in 0..count {
        let frame = src.list.pop_front().expect("source drained under lock");
        dst.list.push_back(frame);
    }
    if count > 0 {
        dst.queue.fill.notify_all();
        src.queue.room.notify_all();
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
