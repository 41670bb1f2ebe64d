/// Associates a readiness registration with a [`Channel`].
///
/// `Token` is a wrapper around `usize` and is used as the key of the event
/// loop's channel table. The poller stores the token as opaque user data for
/// each registration and hands it back with every readiness event, which is
/// how an event finds its way to the callbacks of the channel that caused it.
///
/// The two highest `usize` values are reserved for the loop's wakeup
/// mechanism and its timer fd; user channels never observe them.
///
/// [`Channel`]: crate::channel::ChannelRef
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

/// Token of the loop's wakeup fd (or posted wake event).
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Token of the loop's timer fd, where one participates.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const TIMER_TOKEN: Token = Token(usize::MAX - 1);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
