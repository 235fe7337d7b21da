// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Select: commit to exactly one of several channel operations.
//!
//! A select call runs as a small state machine over the locked channels:
//!
//! - `Scanning`: look for a case that can complete right now. A ready case
//!   wins; otherwise a default case wins; otherwise register the task on
//!   every case and park.
//! - `Parked`: unlock, suspend, re-lock. The wake record names the case
//!   that fired; every other registration is removed. A resume with no wake
//!   record goes back to `Scanning` with the locks still held.
//! - `Resolved`: unlock and return the winner.
//!
//! Each distinct channel is locked once, in ascending `ChannelId` order, so
//! selects over overlapping channel sets cannot deadlock each other. Locks
//! are released in reverse order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::channel::{ChanState, Channel, ChannelId, RecvAttempt, SendAttempt};
use crate::error::{Fatal, SelectError};
use crate::reason::SuspendReason;
use crate::task::{self, TaskRef};
use crate::wait::{WaitCell, Waiter};

/// Hard ceiling on cases per select call.
pub const MAX_CASES: usize = 32;

/// Case direction. The discriminants are the wire codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Never ready, never registered (a nil channel).
    Inactive = 0,
    Recv = 1,
    Send = 2,
    Default = 3,
}

impl Direction {
    /// Numeric wire code of this direction.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of `code`. `None` for unknown codes.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Inactive),
            1 => Some(Self::Recv),
            2 => Some(Self::Send),
            3 => Some(Self::Default),
            _ => None,
        }
    }
}

/// One arm of a select.
///
/// The value slot holds the value to send for a send case, and receives
/// the value for a receive case once it wins.
pub struct SelectCase<'a, T> {
    chan: Option<&'a Channel<T>>,
    dir: Direction,
    slot: Option<T>,
    /// Reserved continuation marker. Carried but never consulted.
    tag: u32,
    /// Reserved. Carried but never consulted.
    timeout: Option<Duration>,
}

impl<'a, T> SelectCase<'a, T> {
    /// Receive from `chan`. The value lands in the case's slot.
    pub fn recv(chan: &'a Channel<T>) -> Self {
        Self {
            chan: Some(chan),
            dir: Direction::Recv,
            slot: None,
            tag: 0,
            timeout: None,
        }
    }

    /// Send `value` on `chan`. If another case wins, the value stays in the
    /// slot and `take_value` gives it back.
    pub fn send(chan: &'a Channel<T>, value: T) -> Self {
        Self {
            chan: Some(chan),
            dir: Direction::Send,
            slot: Some(value),
            tag: 0,
            timeout: None,
        }
    }

    /// Chosen when no other case is ready. At most one per select.
    pub fn default() -> Self {
        Self {
            chan: None,
            dir: Direction::Default,
            slot: None,
            tag: 0,
            timeout: None,
        }
    }

    /// A case that never fires, like a receive on a nil channel.
    pub fn inactive() -> Self {
        Self {
            chan: None,
            dir: Direction::Inactive,
            slot: None,
            tag: 0,
            timeout: None,
        }
    }

    /// Attach an opaque tag for the caller's own dispatch.
    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn with_timeout_hint(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_hint(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn channel(&self) -> Option<&'a Channel<T>> {
        self.chan
    }

    pub fn value(&self) -> Option<&T> {
        self.slot.as_ref()
    }

    /// Take the received value (or the unsent value of a losing send).
    pub fn take_value(&mut self) -> Option<T> {
        self.slot.take()
    }

    fn is_active(&self) -> bool {
        matches!(self.dir, Direction::Recv | Direction::Send) && self.chan.is_some()
    }
}

/// Winning case of a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selected {
    pub index: usize,
    /// For a receive win: true if a real value arrived, false if the
    /// channel was closed and empty. Always false for other cases.
    pub recv_ok: bool,
}

/// Order in which ready cases are polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollOrder {
    /// Fresh random permutation per scan. Fair among ready cases.
    #[default]
    Random,
    /// Listed order. The first ready case wins.
    Listed,
}

/// Select on behalf of the current task, polling in random order.
pub fn select<T>(cases: &mut [SelectCase<'_, T>]) -> Result<Selected, SelectError> {
    select_as(&task::current(), cases, PollOrder::Random)
}

/// Select on behalf of the current task, polling in listed order.
pub fn select_priority<T>(cases: &mut [SelectCase<'_, T>]) -> Result<Selected, SelectError> {
    select_as(&task::current(), cases, PollOrder::Listed)
}

/// Select on behalf of `task`, which must be the calling task.
///
/// With no cases the task parks forever. Panics with
/// `Fatal::SendOnClosedChannel` if a send case targets a closed channel.
pub fn select_as<'a, T>(
    task: &TaskRef,
    cases: &mut [SelectCase<'a, T>],
    order: PollOrder,
) -> Result<Selected, SelectError> {
    if cases.is_empty() {
        park_forever(task);
    }
    if cases.len() > MAX_CASES {
        return Err(SelectError::TooManyCases {
            got: cases.len(),
            max: MAX_CASES,
        });
    }
    let defaults = cases
        .iter()
        .filter(|c| c.dir == Direction::Default)
        .count();
    if defaults > 1 {
        return Err(SelectError::MultipleDefaults { count: defaults });
    }

    trace!(task = %task.id(), cases = cases.len(), ?order, "select");
    let locks = LockSet::new(cases);
    let mut guards = locks.lock_all();
    let mut partner = None;

    let mut phase = Phase::Scanning;
    let selected = loop {
        phase = match phase {
            Phase::Scanning => {
                match scan(task, cases, &locks, &mut guards, order) {
                    Scan::Ready(sel, p) => {
                        partner = p;
                        Phase::Resolved(sel)
                    }
                    Scan::Default(index) => Phase::Resolved(Selected {
                        index,
                        recv_ok: false,
                    }),
                    Scan::Blocked => Phase::Parked(register(task, cases, &locks, &mut guards)),
                }
            }
            Phase::Parked(cell) => {
                LockSet::unlock_all(guards);
                task.scheduler()
                    .suspend_current(task, None, SuspendReason::ChanSelect);
                guards = locks.lock_all();
                match resolve(task, &cell, cases, &locks, &mut guards) {
                    Some(sel) => Phase::Resolved(sel),
                    None => {
                        debug!(task = %task.id(), "select resumed without a wake, rescanning");
                        Phase::Scanning
                    }
                }
            }
            Phase::Resolved(sel) => break sel,
        };
    };

    LockSet::unlock_all(guards);
    if let Some(p) = partner {
        p.wake();
    }
    trace!(task = %task.id(), index = selected.index, recv_ok = selected.recv_ok, "select done");
    Ok(selected)
}

fn park_forever(task: &TaskRef) -> ! {
    debug!(task = %task.id(), "empty select, parking forever");
    loop {
        task.scheduler()
            .suspend_current(task, None, SuspendReason::ChanSelectNoCase);
    }
}

enum Phase<T> {
    Scanning,
    Parked(Arc<WaitCell<T>>),
    Resolved(Selected),
}

enum Scan {
    /// Winner, plus a handoff partner to resume after unlocking.
    Ready(Selected, Option<TaskRef>),
    Default(usize),
    Blocked,
}

type Guards<'a, T> = Vec<MutexGuard<'a, ChanState<T>>>;

/// Distinct channels of a select in lock order, and which one each case
/// uses.
struct LockSet<'a, T> {
    chans: Vec<&'a Channel<T>>,
    slot_of: Vec<Option<usize>>,
}

impl<'a, T> LockSet<'a, T> {
    fn new(cases: &[SelectCase<'a, T>]) -> Self {
        let mut chans: Vec<&'a Channel<T>> = cases
            .iter()
            .filter(|c| c.is_active())
            .filter_map(|c| c.chan)
            .collect();
        chans.sort_by_key(|c| c.id());
        chans.dedup_by_key(|c| c.id());

        let slot_of = cases
            .iter()
            .map(|c| {
                let chan = c.chan.filter(|_| c.is_active())?;
                chans.binary_search_by_key(&chan.id(), |x| x.id()).ok()
            })
            .collect();

        Self { chans, slot_of }
    }

    fn lock_all(&self) -> Guards<'a, T> {
        self.chans.iter().map(|&c| c.lock()).collect()
    }

    fn unlock_all(mut guards: Guards<'a, T>) {
        while let Some(g) = guards.pop() {
            drop(g);
        }
    }

    fn id(&self, slot: usize) -> ChannelId {
        self.chans[slot].id()
    }
}

/// Ready scan. Performs the transfer of the first ready case it finds.
fn scan<T>(
    task: &TaskRef,
    cases: &mut [SelectCase<'_, T>],
    locks: &LockSet<'_, T>,
    guards: &mut Guards<'_, T>,
    order: PollOrder,
) -> Scan {
    let mut poll: Vec<usize> = (0..cases.len()).collect();
    if order == PollOrder::Random {
        poll.shuffle(&mut rand::thread_rng());
    }

    let mut default = None;
    for i in poll {
        let case = &mut cases[i];
        let Some(slot) = locks.slot_of[i] else {
            if case.dir == Direction::Default {
                default = Some(i);
            }
            continue;
        };
        let chan = locks.id(slot);
        let st = &mut guards[slot];

        match case.dir {
            Direction::Recv => match st.try_recv(chan, task.id()) {
                RecvAttempt::Received(value, partner) => {
                    case.slot = Some(value);
                    let sel = Selected {
                        index: i,
                        recv_ok: true,
                    };
                    return Scan::Ready(sel, partner);
                }
                RecvAttempt::Closed => {
                    case.slot = None;
                    let sel = Selected {
                        index: i,
                        recv_ok: false,
                    };
                    return Scan::Ready(sel, None);
                }
                RecvAttempt::Empty => {}
            },
            Direction::Send => {
                let Some(value) = case.slot.take() else {
                    unreachable!("send case {} has no value", i);
                };
                match st.try_send(chan, task.id(), value) {
                    SendAttempt::Sent(partner) => {
                        let sel = Selected {
                            index: i,
                            recv_ok: false,
                        };
                        return Scan::Ready(sel, partner);
                    }
                    SendAttempt::Full(value) => case.slot = Some(value),
                    SendAttempt::Closed(value) => {
                        case.slot = Some(value);
                        Fatal::SendOnClosedChannel { channel: chan }.raise()
                    }
                }
            }
            Direction::Default | Direction::Inactive => {}
        }
    }

    match default {
        Some(i) => Scan::Default(i),
        None => Scan::Blocked,
    }
}

/// Enqueue the task on every active case, in listed order. Send values move
/// into the queue entries.
fn register<T>(
    task: &TaskRef,
    cases: &mut [SelectCase<'_, T>],
    locks: &LockSet<'_, T>,
    guards: &mut Guards<'_, T>,
) -> Arc<WaitCell<T>> {
    let cell = WaitCell::new(task.clone());
    for (i, case) in cases.iter_mut().enumerate() {
        let Some(slot) = locks.slot_of[i] else {
            continue;
        };
        let st = &mut guards[slot];
        match case.dir {
            Direction::Recv => st.recvq.push(Waiter::new(cell.clone(), i, None)),
            Direction::Send => st
                .sendq
                .push(Waiter::new(cell.clone(), i, case.slot.take())),
            Direction::Default | Direction::Inactive => {}
        }
    }
    trace!(task = %task.id(), channels = locks.chans.len(), "select registered");
    cell
}

/// Match the wake record to its case and remove every other registration.
///
/// `None` if the task was resumed without a wake record; all registrations
/// are gone by then and the caller rescans.
fn resolve<T>(
    task: &TaskRef,
    cell: &Arc<WaitCell<T>>,
    cases: &mut [SelectCase<'_, T>],
    locks: &LockSet<'_, T>,
    guards: &mut Guards<'_, T>,
) -> Option<Selected> {
    let mut wake = cell.take_wake();
    let mut winner = None;
    // A send case woken by close. Raised only after every loser is removed.
    let mut closed_send = None;

    for (i, case) in cases.iter_mut().enumerate() {
        let Some(slot) = locks.slot_of[i] else {
            continue;
        };
        let chan = locks.id(slot);

        let fired = winner.is_none() && wake.as_ref().is_some_and(|w| w.matches(chan, case.dir, i));
        if fired {
            if let Some(w) = wake.take() {
                debug!(task = %task.id(), case = i, %chan, by = ?w.by, closed = w.closed, "select woken");
                if case.dir == Direction::Send && w.closed {
                    closed_send = Some(chan);
                }
                let recv_ok = case.dir == Direction::Recv && w.value.is_some();
                if case.dir == Direction::Recv {
                    case.slot = w.value;
                }
                winner = Some(Selected { index: i, recv_ok });
            }
            continue;
        }

        let st = &mut guards[slot];
        let queue = match case.dir {
            Direction::Send => &mut st.sendq,
            _ => &mut st.recvq,
        };
        match queue.remove(cell, i) {
            Some(entry) => {
                if case.dir == Direction::Send {
                    case.slot = entry.value;
                }
            }
            None => Fatal::WaiterMissing {
                task: task.id(),
                channel: chan,
            }
            .raise(),
        }
    }

    if let Some(channel) = closed_send {
        Fatal::SendOnClosedChannel { channel }.raise()
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{buffered, unbuffered};
    use crate::scheduler::spawn;
    use crate::task::TaskState;

    fn wait_parked(t: &TaskRef) {
        while t.state() != TaskState::Waiting {
            std::thread::yield_now();
        }
    }

    #[test]
    fn buffered_recv_is_ready() {
        let ch = buffered(4);
        ch.send(42);
        let mut cases = [SelectCase::recv(&ch)];
        let sel = select(&mut cases).unwrap();
        assert_eq!(sel, Selected { index: 0, recv_ok: true });
        assert_eq!(cases[0].take_value(), Some(42));
    }

    #[test]
    fn picks_the_ready_channel() {
        let a = buffered::<i32>(1);
        let b = buffered(1);
        b.send(7);
        let mut cases = [SelectCase::recv(&a), SelectCase::recv(&b)];
        let sel = select(&mut cases).unwrap();
        assert_eq!(sel.index, 1);
        assert_eq!(cases[1].take_value(), Some(7));
        assert_eq!(cases[0].value(), None);
    }

    #[test]
    fn priority_takes_first_listed() {
        let a = buffered(1);
        let b = buffered(1);
        a.send(1);
        b.send(2);
        let mut cases = [SelectCase::recv(&a), SelectCase::recv(&b)];
        assert_eq!(select_priority(&mut cases).unwrap().index, 0);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn exactly_one_ready_case_is_applied() {
        let a = buffered(1);
        let b = buffered(1);
        a.send(1);
        b.send(2);
        let mut cases = [SelectCase::recv(&a), SelectCase::recv(&b)];
        let sel = select(&mut cases).unwrap();
        assert_eq!(a.len() + b.len(), 1);
        assert_eq!(cases[1 - sel.index].value(), None);
    }

    #[test]
    fn default_short_circuits() {
        let ch = unbuffered::<i32>();
        let mut cases = [SelectCase::recv(&ch), SelectCase::default()];
        let sel = select(&mut cases).unwrap();
        assert_eq!(sel, Selected { index: 1, recv_ok: false });
        assert_eq!(ch.waiting_receivers(), 0);
    }

    #[test]
    fn default_loses_to_ready_case() {
        let ch = buffered(1);
        ch.send(3);
        let mut cases = [SelectCase::default(), SelectCase::recv(&ch)];
        assert_eq!(select(&mut cases).unwrap().index, 1);
    }

    #[test]
    fn send_fills_buffer_before_default() {
        let ch = buffered(1);
        let mut cases = [SelectCase::send(&ch, 7), SelectCase::default()];
        let sel = select(&mut cases).unwrap();
        assert_eq!(sel.index, 0);
        assert_eq!(ch.len(), 1);
        assert_eq!(cases[0].value(), None);
        assert_eq!(ch.recv(), Some(7));
    }

    #[test]
    fn full_send_keeps_its_value_when_default_wins() {
        let ch = buffered(1);
        ch.send(1);
        let mut cases = [SelectCase::send(&ch, 2), SelectCase::default()];
        assert_eq!(select(&mut cases).unwrap().index, 1);
        assert_eq!(cases[0].take_value(), Some(2));
        assert_eq!(ch.len(), 1);
    }

    #[test]
    fn closed_empty_recv_reports_not_ok() {
        let ch = buffered::<i32>(2);
        ch.close().unwrap();
        let mut cases = [SelectCase::recv(&ch)];
        assert_eq!(select(&mut cases).unwrap(), Selected { index: 0, recv_ok: false });
        assert_eq!(cases[0].value(), None);
    }

    #[test]
    fn closed_buffered_drains_first() {
        let ch = buffered(2);
        ch.send(1);
        ch.send(2);
        ch.close().unwrap();
        let mut got = Vec::new();
        loop {
            let mut cases = [SelectCase::recv(&*ch)];
            let sel = select(&mut cases).unwrap();
            if !sel.recv_ok {
                break;
            }
            got.push(cases[0].take_value().unwrap());
        }
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "send on closed channel")]
    fn send_case_on_closed_channel_is_fatal() {
        let ch = buffered(1);
        ch.close().unwrap();
        let mut cases = [SelectCase::send(&ch, 7)];
        let _ = select(&mut cases);
    }

    #[test]
    fn too_many_cases() {
        let ch = buffered::<i32>(1);
        let mut cases: Vec<_> = (0..MAX_CASES + 1).map(|_| SelectCase::recv(&*ch)).collect();
        assert_eq!(
            select(&mut cases),
            Err(SelectError::TooManyCases { got: 33, max: 32 })
        );
    }

    #[test]
    fn max_cases_is_allowed() {
        let ch = buffered(1);
        ch.send(5);
        let mut cases: Vec<_> = (0..MAX_CASES).map(|_| SelectCase::recv(&*ch)).collect();
        assert!(select(&mut cases).unwrap().recv_ok);
    }

    #[test]
    fn multiple_defaults() {
        let mut cases: [SelectCase<'_, i32>; 2] = [SelectCase::default(), SelectCase::default()];
        assert_eq!(
            select(&mut cases),
            Err(SelectError::MultipleDefaults { count: 2 })
        );
    }

    #[test]
    fn inactive_cases_are_skipped() {
        let ch = buffered(1);
        ch.send(9);
        let mut cases = [SelectCase::inactive(), SelectCase::recv(&ch)];
        assert_eq!(select(&mut cases).unwrap().index, 1);

        let mut only_inactive = [SelectCase::<i32>::inactive(), SelectCase::default()];
        assert_eq!(select(&mut only_inactive).unwrap().index, 1);
    }

    #[test]
    fn timeout_hint_is_carried_not_used() {
        let ch = unbuffered::<i32>();
        let mut cases = [
            SelectCase::recv(&ch).with_timeout_hint(Duration::from_millis(1)),
            SelectCase::default(),
        ];
        assert_eq!(cases[0].timeout_hint(), Some(Duration::from_millis(1)));
        assert_eq!(select(&mut cases).unwrap().index, 1);
    }

    #[test]
    fn tag_is_carried_not_used() {
        let ch = unbuffered::<i32>();
        let mut cases = [SelectCase::recv(&ch).with_tag(7), SelectCase::default()];
        assert_eq!(select(&mut cases).unwrap().index, 1);
        assert_eq!(cases[0].tag(), 7);
        assert_eq!(cases[1].tag(), 0);
    }

    #[test]
    fn direction_codes() {
        for d in [Direction::Inactive, Direction::Recv, Direction::Send, Direction::Default] {
            assert_eq!(Direction::from_code(d.code()), Some(d));
        }
        assert_eq!(Direction::from_code(4), None);
    }

    #[test]
    fn lock_set_dedups_and_sorts() {
        let a = unbuffered::<i32>();
        let b = unbuffered::<i32>();
        let cases = [
            SelectCase::recv(&*b),
            SelectCase::default(),
            SelectCase::send(&*a, 1),
            SelectCase::recv(&*b),
        ];
        let locks = LockSet::new(&cases);
        assert_eq!(locks.chans.len(), 2);
        assert!(locks.chans[0].id() < locks.chans[1].id());
        assert_eq!(locks.slot_of, vec![Some(1), None, Some(0), Some(1)]);
    }

    #[test]
    fn parked_recv_woken_by_send() {
        let ch = unbuffered::<i32>();
        let rx = ch.clone();
        let h = spawn(move || {
            let mut cases = [SelectCase::recv(&*rx)];
            let sel = select(&mut cases).unwrap();
            (sel, cases[0].take_value())
        });
        wait_parked(h.task());
        assert_eq!(h.task().suspend_reason(), SuspendReason::ChanSelect);
        ch.send(42);
        let (sel, value) = h.join().unwrap();
        assert_eq!(sel, Selected { index: 0, recv_ok: true });
        assert_eq!(value, Some(42));
    }

    #[test]
    fn same_channel_twice_registers_and_cleans_both() {
        let ch = unbuffered::<i32>();
        let rx = ch.clone();
        let h = spawn(move || {
            let mut cases = [SelectCase::recv(&*rx), SelectCase::recv(&*rx)];
            let sel = select_priority(&mut cases).unwrap();
            (sel, cases[sel.index].take_value())
        });
        wait_parked(h.task());
        assert_eq!(ch.waiting_receivers(), 2);
        let id = h.task().id();
        ch.send(5);
        let (sel, value) = h.join().unwrap();
        assert_eq!(sel.index, 0);
        assert_eq!(value, Some(5));
        assert_eq!(ch.waiting_receivers(), 0);
        assert!(!ch.is_waiting(id));
    }

    #[test]
    fn spurious_resume_rescans() {
        let ch = unbuffered::<i32>();
        let rx = ch.clone();
        let h = spawn(move || {
            let mut cases = [SelectCase::recv(&*rx)];
            let sel = select(&mut cases).unwrap();
            (sel, cases[0].take_value())
        });
        let t = h.task().clone();
        wait_parked(&t);
        // Resume with no handoff: the task must clean up and park again.
        t.wake();
        loop {
            std::thread::yield_now();
            if t.state() == TaskState::Waiting && ch.waiting_receivers() == 1 {
                break;
            }
        }
        ch.send(8);
        let (sel, value) = h.join().unwrap();
        assert!(sel.recv_ok);
        assert_eq!(value, Some(8));
    }
}
