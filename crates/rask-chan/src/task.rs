// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks.
//!
//! The core only needs a small surface from a task: an identity, a way to
//! suspend it, and a way to make it runnable again. Suspension is a permit
//! plus a condition variable, so a resume that races ahead of the suspend
//! is never lost.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::reason::SuspendReason;
use crate::scheduler::{Scheduler, ThreadScheduler};

/// Process-unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, not yet running again.
    Ready = 0,
    Running = 1,
    /// Suspended; see `Task::suspend_reason()`.
    Waiting = 2,
    Complete = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            _ => Self::Complete,
        }
    }
}

pub type TaskRef = Arc<Task>;

pub struct Task {
    id: TaskId,
    name: Option<String>,
    scheduler: Arc<dyn Scheduler>,
    state: AtomicU8,
    reason: AtomicU8,
    /// Set by `unpark`, consumed by `park`.
    permit: Mutex<bool>,
    unparked: Condvar,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("reason", &self.suspend_reason())
            .finish()
    }
}

impl Task {
    pub fn new(scheduler: Arc<dyn Scheduler>, name: Option<String>) -> TaskRef {
        Arc::new(Self {
            id: TaskId::next(),
            name,
            scheduler,
            state: AtomicU8::new(TaskState::Running as u8),
            reason: AtomicU8::new(SuspendReason::None as u8),
            permit: Mutex::new(false),
            unparked: Condvar::new(),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Why the task last suspended. `None` while running.
    pub fn suspend_reason(&self) -> SuspendReason {
        SuspendReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    /// Transition to a new state. Returns false if already Complete.
    pub(crate) fn transition(&self, new: TaskState) -> bool {
        if self.state() == TaskState::Complete {
            return false;
        }
        self.state.store(new as u8, Ordering::Release);
        true
    }

    pub(crate) fn mark_complete(&self) {
        self.state
            .store(TaskState::Complete as u8, Ordering::Release);
    }

    /// Ask the owning scheduler to make this task runnable.
    pub fn wake(self: &Arc<Self>) {
        self.scheduler.resume_task(self);
    }

    /// Block the calling thread until `unpark` or the timeout.
    ///
    /// Building block for `Scheduler` implementations. Must only be called
    /// by the thread running this task. Returns false on timeout.
    pub fn park(&self, timeout: Option<Duration>, reason: SuspendReason) -> bool {
        self.reason.store(reason as u8, Ordering::Release);
        self.transition(TaskState::Waiting);

        let mut permit = self.permit.lock();
        match timeout {
            None => {
                while !*permit {
                    self.unparked.wait(&mut permit);
                }
            }
            Some(d) => {
                let deadline = Instant::now() + d;
                while !*permit {
                    if self.unparked.wait_until(&mut permit, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        let woken = *permit;
        *permit = false;
        drop(permit);

        self.reason
            .store(SuspendReason::None as u8, Ordering::Release);
        self.transition(TaskState::Running);
        woken
    }

    /// Hand the task its wake permit. Idempotent until the next park.
    pub fn unpark(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        // Waiting -> Ready; a task that has not parked yet stays Running.
        let _ = self.state.compare_exchange(
            TaskState::Waiting as u8,
            TaskState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.unparked.notify_one();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

/// The task running on this thread.
///
/// Threads not started by a scheduler are adopted on first use as tasks of
/// the global `ThreadScheduler`.
pub fn current() -> TaskRef {
    CURRENT.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(|| ThreadScheduler::global().adopt_current_thread())
            .clone()
    })
}

/// Install (or clear) the task bound to this thread.
pub(crate) fn set_current(task: Option<TaskRef>) {
    CURRENT.with(|cell| *cell.borrow_mut() = task);
}
