// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Rask channel runtime core.
//!
//! CSP channels and multi-way select for cooperatively scheduled tasks.
//! Channels are bounded (capacity 0 is a rendezvous), close one way, and
//! serve parked senders and receivers in FIFO order. `select` commits to
//! exactly one of up to 32 send/receive cases, or a default case.
//!
//! Components:
//! - channel   — buffer, closed flag, wait queues, blocking send/recv
//! - select    — case model and the lock/scan/register/resolve algorithm
//! - wait      — wait queues and the one-shot wake handshake
//! - task      — task identity, park/unpark, current task
//! - scheduler — `Scheduler` trait and the thread-backed scheduler
//! - reason    — suspend reason codes
//! - config    — runtime configuration and tracing setup

pub mod channel;
pub mod config;
pub mod error;
pub mod reason;
pub mod scheduler;
pub mod select;
pub mod task;
mod wait;

pub use channel::{buffered, unbuffered, Channel, ChannelId};
pub use config::RuntimeConfig;
pub use error::{CloseError, Fatal, JoinError, SelectError, TryRecvError, TrySendError};
pub use reason::SuspendReason;
pub use scheduler::{spawn, Scheduler, TaskHandle, ThreadScheduler};
pub use select::{
    select, select_as, select_priority, Direction, PollOrder, SelectCase, Selected, MAX_CASES,
};
pub use task::{current, Task, TaskId, TaskRef, TaskState};
