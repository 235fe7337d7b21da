// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wait queues and the wake handshake.
//!
//! A parked operation owns one `WaitCell`. Select registers the same cell on
//! every channel it waits on, one `Waiter` entry per case. Whoever wakes the
//! task first claims the cell (a single CAS), writes the `Wake` record into
//! it under its channel lock, and only then resumes the task. Entries whose
//! cell is already claimed are skipped by `dequeue` and left for their owner
//! to remove during cleanup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::ChannelId;
use crate::select::Direction;
use crate::task::{TaskId, TaskRef};

/// What woke a parked task.
#[derive(Debug)]
pub(crate) struct Wake<T> {
    /// Partner task; `None` when the channel was closed.
    pub by: Option<TaskId>,
    pub channel: ChannelId,
    /// Direction of the woken entry (its own, not the partner's).
    pub direction: Direction,
    /// Case index the woken entry was registered for.
    pub case: usize,
    /// Value moved into a woken receiver. `None` for senders and closes.
    pub value: Option<T>,
    pub closed: bool,
}

impl<T> Wake<T> {
    pub fn matches(&self, channel: ChannelId, direction: Direction, case: usize) -> bool {
        self.channel == channel && self.direction == direction && self.case == case
    }
}

/// One-shot wake handshake for a parked operation.
pub(crate) struct WaitCell<T> {
    task: TaskRef,
    claimed: AtomicBool,
    wake: Mutex<Option<Wake<T>>>,
}

impl<T> WaitCell<T> {
    pub fn new(task: TaskRef) -> Arc<Self> {
        Arc::new(Self {
            task,
            claimed: AtomicBool::new(false),
            wake: Mutex::new(None),
        })
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// Win the right to wake this task. Succeeds at most once.
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Record the wake. Caller must hold the claim and the channel lock.
    pub fn complete(&self, wake: Wake<T>) {
        debug_assert!(self.is_claimed());
        *self.wake.lock() = Some(wake);
    }

    pub fn take_wake(&self) -> Option<Wake<T>> {
        self.wake.lock().take()
    }
}

/// A queue entry: the cell, the case it stands for, and for senders the
/// value waiting to be taken.
pub(crate) struct Waiter<T> {
    pub cell: Arc<WaitCell<T>>,
    pub case: usize,
    pub value: Option<T>,
}

impl<T> Waiter<T> {
    pub fn new(cell: Arc<WaitCell<T>>, case: usize, value: Option<T>) -> Self {
        Self { cell, case, value }
    }

    /// Claim-side helper: fill in the wake record and hand back the task to
    /// resume once the channel lock is released.
    pub fn wake(self, wake: Wake<T>) -> TaskRef {
        self.cell.complete(wake);
        self.cell.task().clone()
    }
}

/// FIFO of parked operations for one channel direction.
pub(crate) struct WaitQueue<T> {
    waiters: VecDeque<Waiter<T>>,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }
}

impl<T> WaitQueue<T> {
    pub fn push(&mut self, waiter: Waiter<T>) {
        self.waiters.push_back(waiter);
    }

    /// Remove and claim the longest-waiting entry that is still claimable.
    pub fn dequeue(&mut self) -> Option<Waiter<T>> {
        let pos = self.waiters.iter().position(|w| w.cell.try_claim())?;
        self.waiters.remove(pos)
    }

    /// Remove the entry registered by `cell` for case `case`.
    pub fn remove(&mut self, cell: &Arc<WaitCell<T>>, case: usize) -> Option<Waiter<T>> {
        let pos = self
            .waiters
            .iter()
            .position(|w| w.case == case && Arc::ptr_eq(&w.cell, cell))?;
        self.waiters.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn contains_task(&self, id: TaskId) -> bool {
        self.waiters.iter().any(|w| w.cell.task().id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ThreadScheduler;
    use crate::task::Task;

    fn cell() -> Arc<WaitCell<i32>> {
        WaitCell::new(Task::new(ThreadScheduler::global(), None))
    }

    #[test]
    fn claim_succeeds_once() {
        let c = cell();
        assert!(c.try_claim());
        assert!(!c.try_claim());
        assert!(c.is_claimed());
    }

    #[test]
    fn dequeue_is_fifo() {
        let (a, b) = (cell(), cell());
        let mut q = WaitQueue::default();
        q.push(Waiter::new(a.clone(), 0, Some(1)));
        q.push(Waiter::new(b.clone(), 0, Some(2)));
        let w = q.dequeue().unwrap();
        assert!(Arc::ptr_eq(&w.cell, &a));
        assert_eq!(w.value, Some(1));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn dequeue_skips_claimed_and_leaves_them() {
        let (a, b) = (cell(), cell());
        let mut q = WaitQueue::default();
        q.push(Waiter::new(a.clone(), 0, None));
        q.push(Waiter::new(b.clone(), 0, None));
        assert!(a.try_claim());
        let w = q.dequeue().unwrap();
        assert!(Arc::ptr_eq(&w.cell, &b));
        assert_eq!(q.len(), 1);
        assert!(q.dequeue().is_none());
        // Stale entry is still there for its owner.
        assert!(q.remove(&a, 0).is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn remove_matches_cell_and_case() {
        let a = cell();
        let mut q = WaitQueue::default();
        q.push(Waiter::new(a.clone(), 0, Some(10)));
        q.push(Waiter::new(a.clone(), 3, Some(30)));
        assert!(q.remove(&a, 1).is_none());
        assert_eq!(q.remove(&a, 3).unwrap().value, Some(30));
        assert!(q.contains_task(a.task().id()));
        assert_eq!(q.remove(&a, 0).unwrap().value, Some(10));
        assert!(!q.contains_task(a.task().id()));
    }

    #[test]
    fn wake_record_is_one_shot() {
        let c = cell();
        assert!(c.try_claim());
        c.complete(Wake {
            by: None,
            channel: ChannelId::for_tests(7),
            direction: Direction::Recv,
            case: 2,
            value: Some(5),
            closed: false,
        });
        let w = c.take_wake().unwrap();
        assert!(w.matches(ChannelId::for_tests(7), Direction::Recv, 2));
        assert!(!w.matches(ChannelId::for_tests(7), Direction::Send, 2));
        assert_eq!(w.value, Some(5));
        assert!(c.take_wake().is_none());
    }
}
