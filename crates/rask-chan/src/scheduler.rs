// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler interface and the thread-backed scheduler.
//!
//! Channels and select only talk to a scheduler through `Scheduler`:
//! suspend the current task with a reason, resume some other task. The
//! `ThreadScheduler` gives every task its own OS thread and parks it on a
//! per-task condvar. An M:N scheduler plugs in behind the same trait.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::error::JoinError;
use crate::reason::SuspendReason;
use crate::task::{self, Task, TaskRef, TaskState};

pub trait Scheduler: Send + Sync + 'static {
    /// The task executing on the calling thread.
    fn current_task(&self) -> TaskRef;

    /// Suspend `task`, which must be the calling task, until resumed.
    ///
    /// `timeout: None` waits indefinitely. Returns false if the timeout
    /// elapsed first.
    fn suspend_current(&self, task: &TaskRef, timeout: Option<Duration>, reason: SuspendReason)
        -> bool;

    /// Make a suspended task runnable. A resume delivered before the
    /// matching suspend is kept and consumed by it.
    fn resume_task(&self, task: &TaskRef);
}

/// One OS thread per task.
#[derive(Debug)]
pub struct ThreadScheduler {
    config: RuntimeConfig,
    /// Spawned tasks that have not finished yet.
    live: AtomicUsize,
}

impl ThreadScheduler {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            live: AtomicUsize::new(0),
        })
    }

    /// Process-wide scheduler configured from the environment.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ThreadScheduler>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| ThreadScheduler::new(RuntimeConfig::from_env()))
            .clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of spawned tasks still running.
    pub fn live_tasks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Wrap the calling thread in a task owned by this scheduler.
    pub(crate) fn adopt_current_thread(self: &Arc<Self>) -> TaskRef {
        let name = thread::current().name().map(str::to_string);
        let task = Task::new(self.clone(), name);
        trace!(task = %task.id(), "adopted thread");
        task
    }

    /// Start `f` as a new task on its own thread.
    pub fn try_spawn<T, F>(self: &Arc<Self>, f: F) -> io::Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let task = Task::new(self.clone(), None);
        let mut builder = thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name_prefix, task.id().as_u64()));
        if let Some(bytes) = self.config.stack_size {
            builder = builder.stack_size(bytes);
        }

        let child = task.clone();
        let sched = self.clone();
        self.live.fetch_add(1, Ordering::AcqRel);
        let spawned = builder.spawn(move || {
            task::set_current(Some(child.clone()));
            let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
                Ok(val) => Ok(val),
                Err(e) => Err(panic_message(e.as_ref())),
            };
            child.mark_complete();
            task::set_current(None);
            sched.live.fetch_sub(1, Ordering::AcqRel);
            result
        });
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        debug!(task = %task.id(), "spawned");

        Ok(TaskHandle {
            task,
            handle: Some(handle),
        })
    }

    /// Like `try_spawn`, panicking if the OS refuses a thread.
    pub fn spawn<T, F>(self: &Arc<Self>, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        match self.try_spawn(f) {
            Ok(h) => h,
            Err(e) => panic!("failed to spawn task thread: {}", e),
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn current_task(&self) -> TaskRef {
        task::current()
    }

    fn suspend_current(
        &self,
        task: &TaskRef,
        timeout: Option<Duration>,
        reason: SuspendReason,
    ) -> bool {
        debug!(task = %task.id(), %reason, "suspend");
        let woken = task.park(timeout, reason);
        debug!(task = %task.id(), woken, "resumed");
        woken
    }

    fn resume_task(&self, task: &TaskRef) {
        trace!(task = %task.id(), "resume");
        task.unpark();
    }
}

/// Spawn on the global scheduler.
pub fn spawn<T, F>(f: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    ThreadScheduler::global().spawn(f)
}

fn panic_message(e: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Affine task handle.
///
/// Must be consumed via `join()` or `detach()`. Dropping it otherwise is a
/// bug and panics.
pub struct TaskHandle<T> {
    task: TaskRef,
    handle: Option<JoinHandle<Result<T, String>>>,
}

impl<T> TaskHandle<T> {
    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn is_complete(&self) -> bool {
        self.task.state() == TaskState::Complete
    }

    /// Wait for the task to finish and return its result.
    pub fn join(mut self) -> Result<T, JoinError> {
        let Some(jh) = self.handle.take() else {
            return Err(JoinError::Panicked("task handle already consumed".to_string()));
        };
        match jh.join() {
            Ok(Ok(val)) => Ok(val),
            Ok(Err(msg)) => Err(JoinError::Panicked(msg)),
            Err(e) => Err(JoinError::Panicked(panic_message(e.as_ref()))),
        }
    }

    /// Fire-and-forget. The task keeps running.
    pub fn detach(mut self) {
        let _ = self.handle.take();
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if self.handle.is_some() && !thread::panicking() {
            panic!("TaskHandle for {} dropped without being joined or detached", self.task.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_join() {
        let h = spawn(|| 42);
        assert_eq!(h.join().unwrap(), 42);
    }

    #[test]
    fn spawned_task_is_current_inside() {
        let h = spawn(|| task::current().id());
        let expected = h.task().id();
        assert_eq!(h.join().unwrap(), expected);
    }

    #[test]
    fn spawn_panic_returns_join_error() {
        let h = spawn(|| -> i32 { panic!("boom") });
        match h.join() {
            Err(JoinError::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn task_completes() {
        let h = spawn(|| ());
        let t = h.task().clone();
        h.join().unwrap();
        assert_eq!(t.state(), TaskState::Complete);
    }

    #[test]
    fn thread_names_use_prefix() {
        let sched = ThreadScheduler::new(RuntimeConfig::default().with_thread_name_prefix("chan-test"));
        let h = sched.spawn(|| thread::current().name().map(str::to_string));
        let name = h.join().unwrap().unwrap();
        assert!(name.starts_with("chan-test-"));
        assert_eq!(sched.live_tasks(), 0);
    }

    #[test]
    fn suspend_and_resume_through_trait() {
        let sched = ThreadScheduler::new(RuntimeConfig::default());
        let h = sched.spawn(|| {
            let me = task::current();
            me.scheduler()
                .suspend_current(&me, None, SuspendReason::Sleep)
        });
        let t = h.task().clone();
        while t.state() != TaskState::Waiting {
            thread::yield_now();
        }
        assert_eq!(t.suspend_reason(), SuspendReason::Sleep);
        sched.resume_task(&t);
        assert!(h.join().unwrap());
    }

    #[test]
    #[should_panic(expected = "dropped without being joined")]
    fn dropping_handle_panics() {
        let h = spawn(|| ());
        drop(h);
    }
}
