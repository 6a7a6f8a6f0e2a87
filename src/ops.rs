//! Interest and readiness bitmask for registered resources.
//!
//! The four classic operation bits are kept even though epoll-style
//! notifiers only distinguish readable/writable: connect readiness rides
//! the writable bit and accept readiness rides the readable bit. The
//! mapping happens in one place, at the notifier boundary, so the
//! dispatch algorithm can reason in terms of the four operations.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use mio::event::Event;
use mio::Interest;

#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const READ: Ops = Ops(1 << 0);
    pub const WRITE: Ops = Ops(1 << 2);
    pub const CONNECT: Ops = Ops(1 << 3);
    pub const ACCEPT: Ops = Ops(1 << 4);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one bit is shared with `other`.
    pub const fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn or(self, other: Ops) -> Ops {
        Ops(self.0 | other.0)
    }

    pub const fn without(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }

    /// Collapses the four bits down to what the notifier understands.
    /// Empty interest has no notifier representation; callers reject it
    /// before getting here.
    pub(crate) fn to_interest(self) -> Option<Interest> {
        let readable = self.intersects(Ops::READ.or(Ops::ACCEPT));
        let writable = self.intersects(Ops::WRITE.or(Ops::CONNECT));
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Expands a notifier event back into operation bits. The interest
    /// mask applied afterwards decides which of the aliased bits were
    /// actually asked for.
    pub(crate) fn from_event(event: &Event) -> Ops {
        let mut ops = Ops::NONE;
        if event.is_readable() || event.is_read_closed() {
            ops |= Ops::READ.or(Ops::ACCEPT);
        }
        if event.is_writable() || event.is_write_closed() {
            ops |= Ops::WRITE.or(Ops::CONNECT);
        }
        if event.is_error() {
            ops |= Ops::READ.or(Ops::ACCEPT).or(Ops::WRITE);
        }
        ops
    }
}

impl BitOr for Ops {
    type Output = Ops;
    fn bitor(self, rhs: Ops) -> Ops {
        self.or(rhs)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ops {
    type Output = Ops;
    fn bitand(self, rhs: Ops) -> Ops {
        Ops(self.0 & rhs.0)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (bit, name) in [
            (Ops::READ, "READ"),
            (Ops::WRITE, "WRITE"),
            (Ops::CONNECT, "CONNECT"),
            (Ops::ACCEPT, "ACCEPT"),
        ] {
            if self.contains(bit) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}
