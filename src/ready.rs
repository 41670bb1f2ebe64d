use std::{fmt, ops};

/// The readiness classes a poll reported for one channel.
///
/// Unlike [`Interest`], which is what a channel asked for, `Ready` is what
/// actually happened: it also carries the error, hang-up and priority
/// conditions a poller may report regardless of the registered interest.
///
/// [`Interest`]: crate::Interest
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Ready(u8);

const READABLE: u8 = 0b0_0001;
const WRITABLE: u8 = 0b0_0010;
const ERROR: u8 = 0b0_0100;
const HUP: u8 = 0b0_1000;
const PRIORITY: u8 = 0b1_0000;

impl Ready {
    /// The empty set.
    pub const EMPTY: Ready = Ready(0);

    /// Readable readiness.
    pub const READABLE: Ready = Ready(READABLE);

    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// An error condition on the fd.
    pub const ERROR: Ready = Ready(ERROR);

    /// The peer hung up (or the fd is otherwise defunct).
    pub const HUP: Ready = Ready(HUP);

    /// Priority (out-of-band) data is readable.
    pub const PRIORITY: Ready = Ready(PRIORITY);

    /// Returns true when no readiness is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if readable readiness was reported.
    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    /// Returns true if writable readiness was reported.
    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Returns true if an error condition was reported.
    pub const fn is_error(self) -> bool {
        (self.0 & ERROR) != 0
    }

    /// Returns true if a hang-up was reported.
    pub const fn is_hup(self) -> bool {
        (self.0 & HUP) != 0
    }

    /// Returns true if priority readiness was reported.
    pub const fn is_priority(self) -> bool {
        (self.0 & PRIORITY) != 0
    }

    /// Returns true if any of `other` is contained in `self`.
    pub const fn intersects(self, other: Ready) -> bool {
        (self.0 & other.0) != 0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        for (flag, name) in [
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::ERROR, "ERROR"),
            (Ready::HUP, "HUP"),
            (Ready::PRIORITY, "PRIORITY"),
        ] {
            if self.intersects(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}
