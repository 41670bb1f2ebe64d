//! Cross-thread wakeup for a blocked selector.
//!
//! Three implementations behind one type: `eventfd` on Linux and Android, a
//! kqueue `EVFILT_USER` user event (a synthetic event posted straight to the
//! poller) on the BSD family, and a self-pipe everywhere else. The fd-backed
//! variants participate in the selector as an ordinary readable registration
//! under the reserved wake token; `drain` discards whatever made them
//! readable, giving one-byte semaphore semantics.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod eventfd;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::eventfd::Waker;

#[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
mod kqueue;
#[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
pub(crate) use self::kqueue::Waker;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
)))]
mod pipe;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
)))]
pub(crate) use self::pipe::Waker;
