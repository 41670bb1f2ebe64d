use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by a unix pipe.
///
/// Waker controls both the sending and receiving ends and empties the pipe
/// if writing to it (waking) fails.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: File,
    receiver: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let mut fds: [RawFd; 2] = [-1, -1];
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in fds {
            syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        }
        // SAFETY: `pipe(2)` ensured both fds are valid.
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok(Waker { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The reading end is full so we'll empty the buffer and try
                // again.
                self.drain();
                self.wake()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Empty the pipe's buffer; called when the wake token fires.
    /// This ignores any errors.
    pub(crate) fn drain(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}
