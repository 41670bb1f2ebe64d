use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

use log::{error, trace};

use crate::event_loop::{EventLoop, LoopHandle};
use crate::socket::{self, Socket};
use crate::{InetAddr, Token};

pub(crate) type NewConnectionCallback = Box<dyn FnMut(RawFd, InetAddr) + Send>;

/// The listening side: owns the bound socket and accepts inbound
/// connections, handing each accepted fd to the new-connection callback.
///
/// A reserved idle fd (`/dev/null`) guards against fd exhaustion: on
/// `EMFILE` the reserve is closed, the pending connection accepted and
/// immediately dropped so the backlog drains instead of busy-looping, then
/// the reserve is reopened.
pub struct Acceptor {
    handle: LoopHandle,
    socket: Socket,
    token: Token,
    addr: InetAddr,
    idle_fd: Mutex<Option<File>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: &EventLoop,
        addr: InetAddr,
        reuse_addr: bool,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let family = if addr.is_ipv6() {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let sock = Socket::new_nonblocking(family)?;
        sock.set_reuse_addr(reuse_addr)?;
        sock.set_reuse_port(reuse_port)?;
        sock.bind(&addr)?;
        // Port 0 asked the kernel to pick; read the real one back.
        let addr = if addr.port() == 0 {
            socket::local_addr(sock.fd())?
        } else {
            addr
        };
        let idle_fd = File::open("/dev/null")?;

        let token = event_loop.add_channel(sock.fd());
        let acceptor = Arc::new(Acceptor {
            handle: event_loop.handle(),
            socket: sock,
            token,
            addr,
            idle_fd: Mutex::new(Some(idle_fd)),
            new_connection_cb: Mutex::new(None),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        event_loop.channel(token).set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    /// The bound address (with the kernel-picked port when bound to 0).
    pub fn addr(&self) -> &InetAddr {
        &self.addr
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    /// Starts listening and watching for inbound connections; loop thread
    /// only.
    pub(crate) fn listen(&self) -> io::Result<()> {
        self.handle.assert_in_loop_thread();
        self.socket.listen()?;
        self.handle
            .with(|event_loop| event_loop.channel(self.token).enable_reading());
        trace!("listening on {}", self.addr);
        Ok(())
    }

    fn handle_read(&self) {
        match self.socket.accept() {
            Ok((fd, peer)) => {
                let mut cb = self.new_connection_cb.lock().unwrap();
                match cb.as_mut() {
                    Some(cb) => cb(fd, peer),
                    // Nobody wants it.
                    None => socket::close(fd),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("accept on {} failed: {}", self.addr, err);
                // See "The special problem of accept()ing when you can't"
                // in libev's documentation.
                if err.raw_os_error() == Some(libc::EMFILE) {
                    let mut idle_fd = self.idle_fd.lock().unwrap();
                    idle_fd.take();
                    if let Ok((fd, _)) = self.socket.accept() {
                        socket::close(fd);
                    }
                    *idle_fd = File::open("/dev/null").ok();
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let token = self.token;
        let cleanup = move || {
            let _ = EventLoop::with_current(|event_loop| {
                let channel = event_loop.channel(token);
                channel.disable_all();
                channel.remove();
            });
        };
        if self.handle.is_in_loop_thread() {
            cleanup();
        } else {
            self.handle.queue_in_loop(cleanup);
        }
    }
}
