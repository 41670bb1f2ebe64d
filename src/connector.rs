use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, info, trace, warn};

use crate::event_loop::LoopHandle;
use crate::socket::{self, Socket};
use crate::{InetAddr, Token};

pub(crate) type NewConnectionCallback = Box<dyn FnMut(RawFd) + Send>;
pub(crate) type ConnectErrorCallback = Arc<dyn Fn() + Send + Sync>;

/// First retry delay; doubles per failed attempt.
const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retry delay cap.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Non-blocking outbound connect with optional exponential-backoff retry.
///
/// `connect(2)` usually parks in `EINPROGRESS`; the socket is then watched
/// for writability, and writability alone proves nothing: `SO_ERROR` and a
/// self-connect check decide whether the handshake actually succeeded.
/// Refused and unreachable attempts retry with a doubling delay (500 ms up
/// to 30 s) when retry is enabled.
pub struct Connector {
    handle: LoopHandle,
    server_addr: InetAddr,
    retry: AtomicBool,
    started: AtomicBool,
    state: AtomicU8,
    retry_delay: Mutex<Duration>,
    fd: Mutex<Option<RawFd>>,
    token: Mutex<Option<Token>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    error_cb: Mutex<Option<ConnectErrorCallback>>,
    weak_self: Weak<Connector>,
}

impl Connector {
    pub(crate) fn new(handle: LoopHandle, server_addr: InetAddr, retry: bool) -> Arc<Connector> {
        Arc::new_cyclic(|weak| Connector {
            handle,
            server_addr,
            retry: AtomicBool::new(retry),
            started: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay: Mutex::new(INIT_RETRY_DELAY),
            fd: Mutex::new(None),
            token: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub(crate) fn server_addr(&self) -> &InetAddr {
        &self.server_addr
    }

    pub(crate) fn set_retry(&self, on: bool) {
        self.retry.store(on, Ordering::Relaxed);
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: ConnectErrorCallback) {
        *self.error_cb.lock().unwrap() = Some(cb);
    }

    /// Starts connecting; safe from any thread.
    pub(crate) fn start(&self) {
        self.started.store(true, Ordering::Release);
        let weak = self.weak_self.clone();
        self.handle.run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
    }

    /// Abandons the attempt; a connection already handed over is untouched.
    pub(crate) fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.set_state(State::Disconnected);
        let weak = self.weak_self.clone();
        self.handle.run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.remove_and_reset_channel();
                if let Some(fd) = connector.fd.lock().unwrap().take() {
                    socket::close(fd);
                }
            }
        });
    }

    pub(crate) fn restart(&self) {
        self.stop();
        *self.retry_delay.lock().unwrap() = INIT_RETRY_DELAY;
        self.start();
    }

    fn start_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Disconnected);
        if self.started.load(Ordering::Acquire) {
            self.connect();
        } else {
            trace!("connector stopped, not connecting");
        }
    }

    fn connect(&self) {
        let family = if self.server_addr.is_ipv6() {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let fd = match Socket::new_nonblocking(family) {
            Ok(sock) => sock.into_raw(),
            Err(err) => {
                error!("failed to create connect socket: {}", err);
                self.report_error();
                return;
            }
        };
        *self.fd.lock().unwrap() = Some(fd);

        let errno = match socket::connect(fd, &self.server_addr) {
            Ok(()) => 0,
            Err(err) => err.raw_os_error().unwrap_or(libc::EINVAL),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => {
                trace!("connecting to {}", self.server_addr);
                self.connecting(fd);
            }

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => {
                if self.retry.load(Ordering::Relaxed) {
                    self.retry_later(fd);
                } else {
                    self.fd.lock().unwrap().take();
                    socket::close(fd);
                    self.report_error();
                }
            }

            errno => {
                error!("connect to {} failed: errno {}", self.server_addr, errno);
                self.fd.lock().unwrap().take();
                socket::close(fd);
                self.report_error();
            }
        }
    }

    /// Watches `fd` for writability, which signals the handshake outcome.
    fn connecting(&self, fd: RawFd) {
        self.set_state(State::Connecting);
        debug_assert!(self.token.lock().unwrap().is_none());
        let token = self.handle.with(|event_loop| {
            let token = event_loop.add_channel(fd);
            let channel = event_loop.channel(token);
            let weak = self.weak_self.clone();
            channel.set_write_callback(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write();
                }
            });
            let weak = self.weak_self.clone();
            channel.set_error_callback(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_error();
                }
            });
            let weak = self.weak_self.clone();
            channel.set_close_callback(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_error();
                }
            });
            channel.enable_writing();
            token
        });
        *self.token.lock().unwrap() = Some(token);
    }

    /// Detaches the watch channel; the slab slot survives until the tick
    /// boundary, so doing this from inside the channel's own callback is
    /// fine.
    fn remove_and_reset_channel(&self) {
        if let Some(token) = self.token.lock().unwrap().take() {
            self.handle.with(|event_loop| {
                let channel = event_loop.channel(token);
                channel.disable_all();
                channel.remove();
            });
        }
    }

    fn handle_write(&self) {
        if self.state() != State::Connecting {
            // Already stopped.
            debug_assert_eq!(self.state(), State::Disconnected);
            return;
        }
        self.remove_and_reset_channel();
        let Some(fd) = self.fd.lock().unwrap().take() else {
            return;
        };

        let so_error = socket::take_error(fd).unwrap_or(libc::EBADF);
        if so_error != 0 {
            warn!(
                "connect to {} failed: SO_ERROR = {}",
                self.server_addr, so_error
            );
            if self.retry.load(Ordering::Relaxed) {
                self.retry_later(fd);
            } else {
                socket::close(fd);
            }
            self.report_error();
        } else if socket::is_self_connect(fd) {
            warn!("connect to {}: self connect", self.server_addr);
            if self.retry.load(Ordering::Relaxed) {
                self.retry_later(fd);
            } else {
                socket::close(fd);
            }
            self.report_error();
        } else {
            self.set_state(State::Connected);
            if self.started.load(Ordering::Acquire) {
                let mut cb = self.new_connection_cb.lock().unwrap();
                if let Some(cb) = cb.as_mut() {
                    cb(fd);
                } else {
                    socket::close(fd);
                }
            } else {
                socket::close(fd);
            }
        }
    }

    fn handle_error(&self) {
        if self.state() != State::Connecting {
            return;
        }
        self.set_state(State::Disconnected);
        self.remove_and_reset_channel();
        let Some(fd) = self.fd.lock().unwrap().take() else {
            return;
        };
        let so_error = socket::take_error(fd).unwrap_or(0);
        error!("connect to {}: SO_ERROR = {}", self.server_addr, so_error);
        if self.retry.load(Ordering::Relaxed) {
            self.retry_later(fd);
        } else {
            socket::close(fd);
        }
        self.report_error();
    }

    /// Closes the failed socket and schedules a fresh attempt with a
    /// doubled delay.
    fn retry_later(&self, fd: RawFd) {
        socket::close(fd);
        self.fd.lock().unwrap().take();
        self.set_state(State::Disconnected);
        if !self.started.load(Ordering::Acquire) {
            trace!("connector stopped, not retrying");
            return;
        }
        let delay = {
            let mut delay = self.retry_delay.lock().unwrap();
            let current = *delay;
            *delay = (*delay * 2).min(MAX_RETRY_DELAY);
            current
        };
        info!(
            "retrying connect to {} in {:?}",
            self.server_addr, delay
        );
        let weak = self.weak_self.clone();
        self.handle.run_after(delay, move |_| {
            if let Some(connector) = weak.upgrade() {
                if connector.state() == State::Disconnected {
                    connector.start_in_loop();
                }
            }
        });
    }

    fn report_error(&self) {
        let cb = self.error_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.lock().unwrap().take() {
            socket::close(fd);
        }
    }
}
