use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// (64 bits) and are converted (native endian) into a 64 bit unsigned integer
/// and added to the count. Reads must also be 8 bytes and reset the count to
/// 0, returning the count.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Waker { fd: file })
    }

    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is going to overflow.
                // So we'll reset the counter to 0 and wake it again.
                self.drain();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Reset the eventfd object; called when the wake token fires.
    #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
    pub(crate) fn drain(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        // If the waker hasn't been awoken yet this returns `WouldBlock`,
        // which can be safely ignored.
        let _ = (&self.fd).read(&mut buf);
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
