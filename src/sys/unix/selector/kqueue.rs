use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{cmp, io, ptr, slice};

use crate::{Interest, Ready, Token};

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `flags` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Flags = libc::c_ushort;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Flags = u32;

// Type of the `data` field in the `kevent` structure.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
type Data = libc::intptr_t;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Data = i64;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags as Flags,
            fflags: 0,
            data: 0,
            udata: $data as UData,
        }
    };
}

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    /// Duplicates the kqueue fd, used by the waker to post user events from
    /// other threads.
    #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
    pub(crate) fn try_clone(&self) -> io::Result<Selector> {
        self.kq.try_clone().map(|kq| Selector { kq })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            // `Duration::subsec_nanos` is guaranteed to be less than one
            // billion, making the cast to i32 safe. The cast itself is needed
            // for platforms where C's long is only 32 bits.
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null_mut());

        events.clear();
        syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as Count,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `kevent` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        // Level-triggered: no `EV_CLEAR`, the write path relies on writable
        // staying reported until the interest is dropped.
        let flags = libc::EV_RECEIPT | libc::EV_ADD;
        // At most we need two changes, but maybe we only need 1.
        let mut changes: [MaybeUninit<libc::kevent>; 2] =
            [MaybeUninit::uninit(), MaybeUninit::uninit()];
        let mut n_changes = 0;

        if interest.is_writable() {
            changes[n_changes] = MaybeUninit::new(kevent!(fd, libc::EVFILT_WRITE, flags, token.0));
            n_changes += 1;
        }

        if interest.is_readable() {
            changes[n_changes] = MaybeUninit::new(kevent!(fd, libc::EVFILT_READ, flags, token.0));
            n_changes += 1;
        }

        // Older versions of macOS can return EPIPE when registering a pipe
        // file descriptor where the other end has already disappeared, while
        // still reporting events for it, so EPIPE is ignored here.
        let changes = unsafe {
            // This is safe because we ensure that at least `n_changes` are in
            // the array.
            slice::from_raw_parts_mut(changes[0].as_mut_ptr(), n_changes)
        };
        kevent_register(self.kq.as_raw_fd(), changes, &[libc::EPIPE as Data])
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let flags = libc::EV_RECEIPT;
        let write_flags = if interest.is_writable() {
            flags | libc::EV_ADD
        } else {
            flags | libc::EV_DELETE
        };
        let read_flags = if interest.is_readable() {
            flags | libc::EV_ADD
        } else {
            flags | libc::EV_DELETE
        };

        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_WRITE, write_flags, token.0),
            kevent!(fd, libc::EVFILT_READ, read_flags, token.0),
        ];

        // There is no way to check with which interest the fd was registered,
        // so both filters are modified, adding when required and removing
        // otherwise. ENOENT just means the filter to remove was not there in
        // the first place.
        kevent_register(
            self.kq.as_raw_fd(),
            &mut changes,
            &[libc::ENOENT as Data, libc::EPIPE as Data],
        )
    }

    pub(crate) fn disable(&self, fd: RawFd) -> io::Result<()> {
        self.deregister(fd)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_WRITE, flags, 0),
            kevent!(fd, libc::EVFILT_READ, flags, 0),
        ];

        kevent_register(self.kq.as_raw_fd(), &mut changes, &[libc::ENOENT as Data])
    }

    /// A disabled registration left nothing behind with kqueue.
    pub(crate) fn purge(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    // Used by `Waker`.
    #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
    pub(crate) fn setup_waker(&self, token: Token) -> io::Result<()> {
        let mut kevent = kevent!(
            0,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            token.0
        );

        syscall!(kevent(
            self.kq.as_raw_fd(),
            &kevent,
            1,
            &mut kevent,
            1,
            ptr::null()
        ))
        .and_then(|_| {
            if (kevent.flags & libc::EV_ERROR as Flags) != 0 && kevent.data != 0 {
                Err(io::Error::from_raw_os_error(kevent.data as i32))
            } else {
                Ok(())
            }
        })
    }

    // Used by `Waker`.
    #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
    pub(crate) fn wake(&self, token: Token) -> io::Result<()> {
        let mut kevent = kevent!(
            0,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_RECEIPT,
            token.0
        );
        kevent.fflags = libc::NOTE_TRIGGER;

        syscall!(kevent(
            self.kq.as_raw_fd(),
            &kevent,
            1,
            &mut kevent,
            1,
            ptr::null()
        ))
        .and_then(|_| {
            if (kevent.flags & libc::EV_ERROR as Flags) != 0 && kevent.data != 0 {
                Err(io::Error::from_raw_os_error(kevent.data as i32))
            } else {
                Ok(())
            }
        })
    }
}

/// Register `changes` with `kq`ueue.
fn kevent_register(
    kq: RawFd,
    changes: &mut [libc::kevent],
    ignored_errors: &[Data],
) -> io::Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .or_else(|err| {
        // "When kevent() call fails with EINTR error, all changes in the
        // changelist have been applied" (FreeBSD man page), so it can be
        // safely ignored.
        if err.raw_os_error() == Some(libc::EINTR) {
            Ok(())
        } else {
            Err(err)
        }
    })
    .and_then(|()| check_errors(changes, ignored_errors))
}

/// Check all events for possible errors, it returns the first error found.
fn check_errors(events: &[libc::kevent], ignored_errors: &[Data]) -> io::Result<()> {
    for event in events {
        // We can't use references to packed structures (in checking the
        // ignored errors), so we need to copy the data out before use.
        let data = event.data;
        // Check for the error flag, the actual error will be in the `data`
        // field.
        if (event.flags & libc::EV_ERROR as Flags != 0) && data != 0 && !ignored_errors.contains(&data)
        {
            return Err(io::Error::from_raw_os_error(data as i32));
        }
    }
    Ok(())
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}

pub(crate) type Event = libc::kevent;
pub(crate) struct Events(Vec<libc::kevent>);

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Events {
        Events(Vec::with_capacity(capacity))
    }
}

impl Deref for Events {
    type Target = Vec<libc::kevent>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Events {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// `Events` cannot derive `Send` or `Sync` because of the `udata` pointer in
// the kevent structure, but the array only ever holds kernel-written events.
unsafe impl Send for Events {}
unsafe impl Sync for Events {}

pub(crate) mod event {
    use super::*;

    pub(crate) fn token(event: &Event) -> Token {
        Token(event.udata as usize)
    }

    pub(crate) fn ready(event: &Event) -> Ready {
        let mut ready = Ready::EMPTY;

        match event.filter as Filter {
            f if f == libc::EVFILT_READ as Filter => {
                ready |= Ready::READABLE;
                if event.flags & libc::EV_EOF as Flags != 0 {
                    ready |= Ready::HUP;
                }
            }
            f if f == libc::EVFILT_WRITE as Filter => {
                ready |= Ready::WRITABLE;
            }
            f if f == libc::EVFILT_USER as Filter => {
                ready |= Ready::READABLE;
            }
            _ => {}
        }

        if event.flags & libc::EV_ERROR as Flags != 0 {
            ready |= Ready::ERROR;
        }
        ready
    }
}
