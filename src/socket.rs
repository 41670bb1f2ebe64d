use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::sys::net::{socket_addr, to_socket_addr};
use crate::InetAddr;

/// Exclusive owner of a stream-socket fd.
///
/// Dropping a `Socket` closes the fd. All sockets are created non-blocking
/// and close-on-exec.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking TCP socket for the given address family.
    pub fn new_nonblocking(family: libc::c_int) -> io::Result<Socket> {
        #[cfg(not(any(target_os = "ios", target_os = "macos")))]
        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP
        ))?;

        // No SOCK_NONBLOCK/SOCK_CLOEXEC on Apple platforms; and writes
        // there signal SIGPIPE unless the socket opts out.
        #[cfg(any(target_os = "ios", target_os = "macos"))]
        let fd = {
            let fd = syscall!(socket(family, libc::SOCK_STREAM, libc::IPPROTO_TCP))?;
            set_nonblock_cloexec(fd)?;
            let opt: libc::c_int = 1;
            syscall!(setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &opt as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            ))?;
            fd
        };

        // SAFETY: `socket(2)` ensures the fd is valid.
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Takes ownership of an fd produced by `accept(2)` or a completed
    /// non-blocking connect.
    ///
    /// # Safety-adjacent invariant
    ///
    /// The fd must not have another owner; `Socket` will close it.
    pub fn from_accepted(fd: RawFd) -> Socket {
        debug_assert!(fd >= 0);
        // SAFETY: per the documented single-owner invariant.
        Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Releases ownership of the fd without closing it.
    pub(crate) fn into_raw(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    pub fn bind(&self, addr: &InetAddr) -> io::Result<()> {
        let sock_addr: SocketAddr = (*addr).into();
        let (raw, len) = socket_addr(&sock_addr);
        syscall!(bind(self.fd(), raw.as_ptr(), len)).map(|_| ())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd(), libc::SOMAXCONN)).map(|_| ())
    }

    /// Accepts one pending connection, returning the (already non-blocking,
    /// close-on-exec) fd and the peer address.
    pub fn accept(&self) -> io::Result<(RawFd, InetAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        #[cfg(not(any(target_os = "ios", target_os = "macos")))]
        let fd = syscall!(accept4(
            self.fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;

        #[cfg(any(target_os = "ios", target_os = "macos"))]
        let fd = {
            let fd = syscall!(accept(
                self.fd(),
                storage.as_mut_ptr() as *mut libc::sockaddr,
                &mut len,
            ))?;
            set_nonblock_cloexec(fd)?;
            fd
        };

        // SAFETY: the kernel initialised the storage for us.
        let peer = unsafe { to_socket_addr(storage.as_ptr()) }
            .map(InetAddr::from)
            .unwrap_or_else(|_| InetAddr::unspecified());
        Ok((fd, peer))
    }

    /// Half-closes the write side.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd(), libc::SHUT_WR)).map(|_| ())
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let opt: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &opt as *const _ as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

#[cfg(any(target_os = "ios", target_os = "macos"))]
fn set_nonblock_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL, 0))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    let flags = syscall!(fcntl(fd, libc::F_GETFD, 0))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)).map(|_| ())
}

/// Starts a non-blocking connect on `fd`; the usual return is an
/// `EINPROGRESS` error.
pub(crate) fn connect(fd: RawFd, addr: &InetAddr) -> io::Result<()> {
    let sock_addr: SocketAddr = (*addr).into();
    let (raw, len) = socket_addr(&sock_addr);
    syscall!(connect(fd, raw.as_ptr(), len)).map(|_| ())
}

/// The pending `SO_ERROR` of `fd`, cleared by reading it.
pub(crate) fn take_error(fd: RawFd) -> io::Result<libc::c_int> {
    let mut optval: libc::c_int = 0;
    let mut optlen = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut optval as *mut _ as *mut libc::c_void,
        &mut optlen,
    ))?;
    Ok(optval)
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<InetAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    // SAFETY: the kernel initialised the storage for us.
    unsafe { to_socket_addr(storage.as_ptr()) }.map(InetAddr::from)
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<InetAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    // SAFETY: the kernel initialised the storage for us.
    unsafe { to_socket_addr(storage.as_ptr()) }.map(InetAddr::from)
}

/// A non-blocking connect can be routed back to its own socket when source
/// and destination collide; such a "connection" is useless and is retried.
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => {
            std::net::SocketAddr::from(local) == std::net::SocketAddr::from(peer)
        }
        _ => false,
    }
}

/// Closes a raw fd that is not (yet) owned by a `Socket`.
pub(crate) fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

/// `write(2)` that never raises SIGPIPE.
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    #[cfg(not(any(target_os = "ios", target_os = "macos")))]
    let n = syscall!(send(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        libc::MSG_NOSIGNAL
    ))?;

    // SO_NOSIGPIPE was set at socket creation.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    let n = syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len()))?;

    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_lifecycle() {
        let sock = Socket::new_nonblocking(libc::AF_INET).unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.set_tcp_nodelay(true).unwrap();
        sock.bind(&InetAddr::loopback(0)).unwrap();
        sock.listen().unwrap();
        let bound = local_addr(sock.fd()).unwrap();
        assert!(bound.port() != 0);
        assert!(bound.is_loopback());
        // Nothing pending on a fresh listener.
        let err = sock.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn so_error_is_clear_on_fresh_socket() {
        let sock = Socket::new_nonblocking(libc::AF_INET).unwrap();
        assert_eq!(take_error(sock.fd()).unwrap(), 0);
    }
}
