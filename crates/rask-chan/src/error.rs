// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types for channel, select and task operations.

use std::fmt;

use thiserror::Error;

use crate::channel::ChannelId;
use crate::task::TaskId;

/// Rejected select call. Both variants are caller bugs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("select supports at most {max} cases, got {got}")]
    TooManyCases { got: usize, max: usize },
    #[error("select has {count} default cases, at most one is allowed")]
    MultipleDefaults { count: usize },
}

/// Non-blocking receive found nothing to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// No value buffered and no sender parked.
    #[error("channel is empty")]
    Empty,
    /// Closed and drained.
    #[error("channel is closed and empty")]
    Closed,
}

/// Non-blocking send could not complete. The value is handed back.
pub enum TrySendError<T> {
    /// Buffer full and no receiver parked.
    Full(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) => v,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel is full"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseError {
    #[error("close of closed channel {0}")]
    AlreadyClosed(ChannelId),
}

/// Error returned by `TaskHandle::join()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The task body panicked; carries the panic message.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Unrecoverable conditions. These abort the offending task with a panic
/// whose message is the `Display` of the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("send on closed channel {channel}")]
    SendOnClosedChannel { channel: ChannelId },
    #[error("select: {task} missing from a wait queue of channel {channel}")]
    WaiterMissing { task: TaskId, channel: ChannelId },
}

impl Fatal {
    /// Log the condition and abort the current task.
    #[track_caller]
    pub(crate) fn raise(self) -> ! {
        tracing::error!(condition = %self, "fatal channel condition");
        panic!("{}", self)
    }
}
