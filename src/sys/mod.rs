//! Module with system specific types.
//!
//! Required types:
//!
//! * `Selector`: readiness wait and subscription, backed by the OS primitive
//!   (epoll, kqueue or poll).
//! * `Event` and `Events`: the native readiness event and the array
//!   `Selector::select` fills, plus an `event` module translating a native
//!   event into a [`Token`](crate::Token) and a [`Ready`](crate::Ready) mask.
//! * `Waker`: a way to wake a blocked `Selector::select` call from another
//!   thread.
//! * `TimerFd` (where the OS has one): a timer that participates in the
//!   selector as an ordinary readiness source.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use self::unix::*;

#[cfg(not(unix))]
compile_error!("netloop only supports unix targets");
