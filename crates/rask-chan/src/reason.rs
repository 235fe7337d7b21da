// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspend reasons.
//!
//! One enumeration shared by every part of the runtime that parks a task,
//! so a parked task can always say why it is parked. Codes are stable.

use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendReason {
    None = 0,
    ChanSend,
    ChanRecv,
    ChanSelect,
    /// Empty select. Nothing will ever wake it.
    ChanSelectNoCase,
    Connect,
    Read,
    Readv,
    Recv,
    RecvFrom,
    Write,
    Writev,
    Send,
    SendTo,
    SendMsg,
    Poll,
    Select,
    Accept,
    Sleep,
    Usleep,
    Nanosleep,
    GetHostByNameR,
    GetHostByName2R,
    GetHostByAddr,
}

impl SuspendReason {
    pub const ALL: [SuspendReason; 24] = [
        Self::None,
        Self::ChanSend,
        Self::ChanRecv,
        Self::ChanSelect,
        Self::ChanSelectNoCase,
        Self::Connect,
        Self::Read,
        Self::Readv,
        Self::Recv,
        Self::RecvFrom,
        Self::Write,
        Self::Writev,
        Self::Send,
        Self::SendTo,
        Self::SendMsg,
        Self::Poll,
        Self::Select,
        Self::Accept,
        Self::Sleep,
        Self::Usleep,
        Self::Nanosleep,
        Self::GetHostByNameR,
        Self::GetHostByName2R,
        Self::GetHostByAddr,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Unknown codes map to `None`.
    pub fn from_u8(v: u8) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or(Self::None)
    }

    /// True for the channel family (send, recv, select).
    pub fn is_channel(self) -> bool {
        matches!(
            self,
            Self::ChanSend | Self::ChanRecv | Self::ChanSelect | Self::ChanSelectNoCase
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ChanSend => "chan send",
            Self::ChanRecv => "chan recv",
            Self::ChanSelect => "chan select",
            Self::ChanSelectNoCase => "chan select (no cases)",
            Self::Connect => "connect",
            Self::Read => "read",
            Self::Readv => "readv",
            Self::Recv => "recv",
            Self::RecvFrom => "recvfrom",
            Self::Write => "write",
            Self::Writev => "writev",
            Self::Send => "send",
            Self::SendTo => "sendto",
            Self::SendMsg => "sendmsg",
            Self::Poll => "poll",
            Self::Select => "select",
            Self::Accept => "accept",
            Self::Sleep => "sleep",
            Self::Usleep => "usleep",
            Self::Nanosleep => "nanosleep",
            Self::GetHostByNameR => "gethostbyname_r",
            Self::GetHostByName2R => "gethostbyname2_r",
            Self::GetHostByAddr => "gethostbyaddr",
        }
    }
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
