use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, trace};

use crate::acceptor::Acceptor;
use crate::connection::{TcpConnection, TcpConnectionPtr};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::EventLoopThreadPool;
use crate::socket;
use crate::wheel::TimingWheel;
use crate::{InetAddr, MessageBuffer};

/// A TCP server: acceptor, connection set, optional io-loop pool, and one
/// timing wheel per loop when idle kick-off is enabled.
///
/// The acceptor runs on the loop the server was created with; accepted
/// connections are distributed round-robin over the pool (or kept on the
/// acceptor loop without one) and live their whole life on that io loop.
pub struct TcpServer {
    handle: LoopHandle,
    name: String,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    addr: InetAddr,
    // Keyed by connection identity (pointer value); touched from io loops
    // and the server loop.
    conns: Mutex<HashMap<usize, TcpConnectionPtr>>,
    recv_msg_cb: Mutex<Option<crate::connection::RecvMessageCallback>>,
    connection_cb: Mutex<Option<crate::connection::ConnectionCallback>>,
    write_complete_cb: Mutex<Option<crate::connection::WriteCompleteCallback>>,
    pool: Mutex<Option<Arc<EventLoopThreadPool>>>,
    wheels: Mutex<HashMap<u64, Arc<TimingWheel>>>,
    idle_timeout: Mutex<Duration>,
    started: AtomicBool,
    weak_self: Weak<TcpServer>,
}

impl TcpServer {
    /// Binds `addr` on `event_loop`. The server accepts nothing until
    /// [`start`](TcpServer::start).
    pub fn new(
        event_loop: &EventLoop,
        addr: InetAddr,
        name: &str,
        reuse_addr: bool,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(event_loop, addr, reuse_addr, reuse_port)?;
        let addr = *acceptor.addr();
        let server = Arc::new_cyclic(|weak| TcpServer {
            handle: event_loop.handle(),
            name: name.to_string(),
            acceptor: Mutex::new(Some(acceptor)),
            addr,
            conns: Mutex::new(HashMap::new()),
            recv_msg_cb: Mutex::new(None),
            connection_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            pool: Mutex::new(None),
            wheels: Mutex::new(HashMap::new()),
            idle_timeout: Mutex::new(Duration::ZERO),
            started: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .set_new_connection_callback(Box::new(move |fd, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer);
                }
            }));
        Ok(server)
    }

    /// The bound listening address.
    pub fn addr(&self) -> &InetAddr {
        &self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Round-robin target loops for new connections.
    pub fn set_io_loop_pool(&self, pool: Arc<EventLoopThreadPool>) {
        *self.pool.lock().unwrap() = Some(pool);
    }

    /// Kicks connections with no traffic for `timeout`; must be set before
    /// [`start`](TcpServer::start).
    pub fn set_idle_timeout(&self, timeout: Duration) {
        *self.idle_timeout.lock().unwrap() = timeout;
    }

    pub fn set_recv_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, &mut MessageBuffer) + Send + Sync + 'static,
    ) {
        *self.recv_msg_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        *self.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Sets up the per-loop timing wheels and starts listening.
    pub fn start(&self) {
        let server = self.to_arc();
        self.handle.run_in_loop(move || {
            if server.started.swap(true, Ordering::AcqRel) {
                return;
            }
            let idle = *server.idle_timeout.lock().unwrap();
            if !idle.is_zero() {
                let mut wheels = server.wheels.lock().unwrap();
                wheels.insert(server.handle.id(), server.new_wheel(server.handle.clone(), idle));
                if let Some(pool) = server.pool.lock().unwrap().as_ref() {
                    for handle in pool.handles() {
                        wheels.insert(handle.id(), server.new_wheel(handle.clone(), idle));
                    }
                }
                trace!("{}: {} timing wheels armed", server.name, wheels.len());
            }
            if let Some(acceptor) = server.acceptor.lock().unwrap().as_ref() {
                if let Err(err) = acceptor.listen() {
                    error!("{}: listen failed: {}", server.name, err);
                }
            }
        });
    }

    fn new_wheel(&self, handle: LoopHandle, idle: Duration) -> Arc<TimingWheel> {
        // Small timeouts get a snug ring so the wheel stays one-ringed;
        // larger ones use the default layout.
        let buckets = (idle.as_secs() as usize + 1).min(crate::wheel::BUCKETS_PER_RING).max(2);
        TimingWheel::with_layout(
            handle,
            idle.max(Duration::from_secs(2)),
            crate::wheel::TICK_INTERVAL,
            buckets,
        )
    }

    /// Runs on the acceptor loop; builds the connection on its io loop.
    fn new_connection(&self, fd: RawFd, peer: InetAddr) {
        trace!("{}: new connection fd={} peer={}", self.name, fd, peer);
        self.handle.assert_in_loop_thread();
        let io_handle = self
            .pool
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|pool| pool.next_loop())
            .unwrap_or_else(|| self.handle.clone());

        let server = self.to_arc();
        io_handle.run_in_loop(move || {
            let _ = EventLoop::with_current(|event_loop| {
                let local = socket::local_addr(fd).unwrap_or_else(|_| InetAddr::unspecified());
                let conn = TcpConnection::new(event_loop, fd, local, peer);

                let idle = *server.idle_timeout.lock().unwrap();
                if !idle.is_zero() {
                    if let Some(wheel) = server.wheels.lock().unwrap().get(&event_loop.id()) {
                        conn.enable_kicking_off(idle, wheel);
                    }
                }

                if let Some(cb) = server.recv_msg_cb.lock().unwrap().clone() {
                    conn.set_recv_msg_callback(cb);
                } else {
                    conn.set_recv_msg_callback(Arc::new(|_conn, buffer: &mut MessageBuffer| {
                        error!(
                            "unhandled message of {} bytes, dropping",
                            buffer.readable_bytes()
                        );
                        buffer.retrieve_all();
                    }));
                }
                if let Some(cb) = server.connection_cb.lock().unwrap().clone() {
                    conn.set_connection_callback(cb);
                }
                if let Some(cb) = server.write_complete_cb.lock().unwrap().clone() {
                    conn.set_write_complete_callback(cb);
                }
                let weak = Arc::downgrade(&server);
                conn.set_close_callback(Arc::new(move |conn| {
                    if let Some(server) = weak.upgrade() {
                        server.connection_closed(conn);
                    }
                }));

                server
                    .conns
                    .lock()
                    .unwrap()
                    .insert(Arc::as_ptr(&conn) as usize, Arc::clone(&conn));
                conn.connect_established();
            });
        });
    }

    /// Entered from the connection's io loop; the set mutation is
    /// serialized through the server loop.
    fn connection_closed(&self, conn: &TcpConnectionPtr) {
        trace!("{}: connection {} closed", self.name, conn.name());
        if self.handle.is_in_loop_thread() {
            self.handle_close_in_loop(conn);
        } else {
            let server = self.to_arc();
            let conn = Arc::clone(conn);
            self.handle
                .queue_in_loop(move || server.handle_close_in_loop(&conn));
        }
    }

    fn handle_close_in_loop(&self, conn: &TcpConnectionPtr) {
        let removed = self
            .conns
            .lock()
            .unwrap()
            .remove(&(Arc::as_ptr(conn) as usize));
        debug_assert!(removed.is_some());
        // The connection may still sit in its loop's active-channel list
        // for this tick; destruction is deferred behind it.
        let to_destroy = Arc::clone(conn);
        conn.loop_handle()
            .queue_in_loop(move || to_destroy.connect_destroyed());
    }

    /// Closes the listener and force-closes every connection. Blocks until
    /// the teardown ran on the server loop.
    pub fn stop(&self) {
        let teardown = {
            let server = self.to_arc();
            move || {
                server.acceptor.lock().unwrap().take();
                let conns: Vec<_> = server.conns.lock().unwrap().values().cloned().collect();
                for conn in conns {
                    conn.force_close();
                }
            }
        };
        if self.handle.is_in_loop_thread() {
            teardown();
        } else {
            let (tx, rx) = mpsc::channel();
            self.handle.queue_in_loop(move || {
                teardown();
                let _ = tx.send(());
            });
            let _ = rx.recv();
        }
        self.pool.lock().unwrap().take();
        self.wheels.lock().unwrap().clear();
    }

    fn to_arc(&self) -> Arc<TcpServer> {
        self.weak_self
            .upgrade()
            .expect("server outlived its last strong reference")
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        trace!("server {} dropped", self.name);
    }
}
