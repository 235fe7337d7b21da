// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels.
//!
//! A channel is one lock over a bounded buffer, a closed flag and two wait
//! queues. Every transfer rule lives on `ChanState` and runs with the lock
//! held; blocking `send`/`recv` and `select` are thin drivers around it.
//!
//! Capacity 0 is a rendezvous channel: a send completes only by handing
//! the value to a parked receiver, or by parking until one arrives.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::{CloseError, Fatal, TryRecvError, TrySendError};
use crate::reason::SuspendReason;
use crate::select::Direction;
use crate::task::{self, TaskId, TaskRef};
use crate::wait::{WaitCell, WaitQueue, Wake, Waiter};

/// Process-unique channel identity. Also the lock order key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ChannelId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id, as used for lock ordering.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(v: u64) -> Self {
        ChannelId(v)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

/// Create a buffered channel with capacity `n`.
pub fn buffered<T>(n: usize) -> Arc<Channel<T>> {
    Arc::new(Channel::new(n))
}

/// Create an unbuffered (rendezvous) channel.
pub fn unbuffered<T>() -> Arc<Channel<T>> {
    Arc::new(Channel::new(0))
}

pub struct Channel<T> {
    id: ChannelId,
    state: Mutex<ChanState<T>>,
}

/// Everything behind the channel lock.
pub(crate) struct ChanState<T> {
    buf: VecDeque<T>,
    cap: usize,
    closed: bool,
    pub sendq: WaitQueue<T>,
    pub recvq: WaitQueue<T>,
}

/// Outcome of a send attempted under the lock.
pub(crate) enum SendAttempt<T> {
    /// Done. Resume the partner, if any, after unlocking.
    Sent(Option<TaskRef>),
    Full(T),
    Closed(T),
}

/// Outcome of a receive attempted under the lock.
pub(crate) enum RecvAttempt<T> {
    Received(T, Option<TaskRef>),
    /// Closed and drained.
    Closed,
    Empty,
}

impl<T> ChanState<T> {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
            closed: false,
            sendq: WaitQueue::default(),
            recvq: WaitQueue::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn enqueue_buffered(&mut self, value: T) {
        debug_assert!(self.buf.len() < self.cap);
        self.buf.push_back(value);
    }

    pub fn dequeue_buffered(&mut self) -> Option<T> {
        self.buf.pop_front()
    }

    /// Send without parking. Checks, in order: closed, a parked receiver
    /// (direct handoff), buffer space.
    pub fn try_send(&mut self, chan: ChannelId, by: TaskId, value: T) -> SendAttempt<T> {
        if self.closed {
            return SendAttempt::Closed(value);
        }
        if let Some(waiter) = self.recvq.dequeue() {
            trace!(%chan, %by, to = %waiter.cell.task().id(), "handoff to parked receiver");
            let case = waiter.case;
            let partner = waiter.wake(Wake {
                by: Some(by),
                channel: chan,
                direction: Direction::Recv,
                case,
                value: Some(value),
                closed: false,
            });
            return SendAttempt::Sent(Some(partner));
        }
        if self.buf.len() < self.cap {
            self.enqueue_buffered(value);
            return SendAttempt::Sent(None);
        }
        SendAttempt::Full(value)
    }

    /// Receive without parking. Checks, in order: a parked sender, buffered
    /// values, closed.
    ///
    /// With a parked sender on a buffered channel the buffer is full, so the
    /// head is taken and the sender's value goes to the tail.
    pub fn try_recv(&mut self, chan: ChannelId, by: TaskId) -> RecvAttempt<T> {
        if let Some(mut waiter) = self.sendq.dequeue() {
            trace!(%chan, %by, from = %waiter.cell.task().id(), "handoff from parked sender");
            let carried = waiter.value.take();
            let value = match (self.dequeue_buffered(), carried) {
                (Some(head), Some(carried)) => {
                    self.buf.push_back(carried);
                    head
                }
                (None, Some(carried)) => carried,
                (Some(head), None) => head,
                (None, None) => unreachable!("parked sender without a value on {}", chan),
            };
            let case = waiter.case;
            let partner = waiter.wake(Wake {
                by: Some(by),
                channel: chan,
                direction: Direction::Send,
                case,
                value: None,
                closed: false,
            });
            return RecvAttempt::Received(value, Some(partner));
        }
        if let Some(value) = self.dequeue_buffered() {
            return RecvAttempt::Received(value, None);
        }
        if self.closed {
            return RecvAttempt::Closed;
        }
        RecvAttempt::Empty
    }

    /// Set the closed flag and wake every claimable waiter.
    fn close(&mut self, chan: ChannelId) -> Result<Vec<TaskRef>, CloseError> {
        if self.closed {
            return Err(CloseError::AlreadyClosed(chan));
        }
        self.closed = true;

        let mut woken = Vec::new();
        while let Some(waiter) = self.recvq.dequeue() {
            let case = waiter.case;
            woken.push(waiter.wake(Wake {
                by: None,
                channel: chan,
                direction: Direction::Recv,
                case,
                value: None,
                closed: true,
            }));
        }
        while let Some(waiter) = self.sendq.dequeue() {
            let case = waiter.case;
            woken.push(waiter.wake(Wake {
                by: None,
                channel: chan,
                direction: Direction::Send,
                case,
                value: None,
                closed: true,
            }));
        }
        Ok(woken)
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("len", &st.len())
            .field("cap", &st.cap)
            .field("closed", &st.closed)
            .field("senders", &st.sendq.len())
            .field("receivers", &st.recvq.len())
            .finish()
    }
}

impl<T> Channel<T> {
    /// A channel with capacity `cap`. Zero is a rendezvous channel.
    pub fn new(cap: usize) -> Self {
        Self {
            id: ChannelId::next(),
            state: Mutex::new(ChanState::new(cap)),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChanState<T>> {
        self.state.lock()
    }

    /// Values currently buffered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }

    /// Tasks parked sending on this channel (including stale select entries
    /// not yet cleaned up by their owner).
    pub fn waiting_senders(&self) -> usize {
        self.lock().sendq.len()
    }

    pub fn waiting_receivers(&self) -> usize {
        self.lock().recvq.len()
    }

    /// Whether `task` has an entry in either wait queue.
    pub fn is_waiting(&self, task: TaskId) -> bool {
        let st = self.lock();
        st.sendq.contains_task(task) || st.recvq.contains_task(task)
    }

    /// Blocking send from the current task.
    ///
    /// Panics if the channel is closed, or gets closed while parked.
    pub fn send(&self, value: T) {
        self.send_as(&task::current(), value)
    }

    /// Blocking send on behalf of `task`, suspending through its scheduler.
    pub fn send_as(&self, task: &TaskRef, value: T) {
        let mut st = self.lock();
        let value = match st.try_send(self.id, task.id(), value) {
            SendAttempt::Sent(partner) => {
                drop(st);
                if let Some(p) = partner {
                    p.wake();
                }
                return;
            }
            SendAttempt::Closed(_) => {
                drop(st);
                Fatal::SendOnClosedChannel { channel: self.id }.raise()
            }
            SendAttempt::Full(value) => value,
        };

        let cell = WaitCell::new(task.clone());
        st.sendq.push(Waiter::new(cell.clone(), 0, Some(value)));
        drop(st);

        let wake = wait_for_wake(task, &cell, SuspendReason::ChanSend);
        if wake.closed {
            Fatal::SendOnClosedChannel { channel: self.id }.raise()
        }
    }

    /// Blocking receive from the current task.
    ///
    /// `None` once the channel is closed and drained.
    pub fn recv(&self) -> Option<T> {
        self.recv_as(&task::current())
    }

    /// Blocking receive on behalf of `task`, suspending through its
    /// scheduler.
    pub fn recv_as(&self, task: &TaskRef) -> Option<T> {
        let mut st = self.lock();
        match st.try_recv(self.id, task.id()) {
            RecvAttempt::Received(value, partner) => {
                drop(st);
                if let Some(p) = partner {
                    p.wake();
                }
                return Some(value);
            }
            RecvAttempt::Closed => return None,
            RecvAttempt::Empty => {}
        }

        let cell = WaitCell::new(task.clone());
        st.recvq.push(Waiter::new(cell.clone(), 0, None));
        drop(st);

        wait_for_wake(task, &cell, SuspendReason::ChanRecv).value
    }

    /// Non-blocking send. Panics on a closed channel, like `send`.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let by = task::current().id();
        let mut st = self.lock();
        match st.try_send(self.id, by, value) {
            SendAttempt::Sent(partner) => {
                drop(st);
                if let Some(p) = partner {
                    p.wake();
                }
                Ok(())
            }
            SendAttempt::Full(value) => Err(TrySendError::Full(value)),
            SendAttempt::Closed(_) => {
                drop(st);
                Fatal::SendOnClosedChannel { channel: self.id }.raise()
            }
        }
    }

    /// Non-blocking receive. `Empty` when nothing is ready, `Closed` once
    /// closed and drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let by = task::current().id();
        let mut st = self.lock();
        match st.try_recv(self.id, by) {
            RecvAttempt::Received(value, partner) => {
                drop(st);
                if let Some(p) = partner {
                    p.wake();
                }
                Ok(value)
            }
            RecvAttempt::Closed => Err(TryRecvError::Closed),
            RecvAttempt::Empty => Err(TryRecvError::Empty),
        }
    }

    /// Close the channel. Buffered values stay receivable.
    ///
    /// Parked receivers wake with no value, parked senders wake and fail.
    pub fn close(&self) -> Result<(), CloseError> {
        let woken = self.lock().close(self.id)?;
        debug!(chan = %self.id, woken = woken.len(), "closed");
        for t in woken {
            t.wake();
        }
        Ok(())
    }
}

/// Park until `cell` carries a wake record. Resumes without one are
/// spurious and park again.
fn wait_for_wake<T>(task: &TaskRef, cell: &Arc<WaitCell<T>>, reason: SuspendReason) -> Wake<T> {
    loop {
        if let Some(wake) = cell.take_wake() {
            return wake;
        }
        task.scheduler().suspend_current(task, None, reason);
    }
}
