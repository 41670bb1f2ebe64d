use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{info, trace, warn};

use crate::connection::{TcpConnection, TcpConnectionPtr};
use crate::connector::Connector;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::socket;
use crate::{InetAddr, MessageBuffer};

/// A TCP client: one connector, at most one live connection.
///
/// With retry enabled the connector backs off exponentially while dialing
/// and the client re-dials when an established connection drops.
pub struct TcpClient {
    handle: LoopHandle,
    name: String,
    connector: Arc<Connector>,
    conn: Mutex<Option<TcpConnectionPtr>>,
    recv_msg_cb: Mutex<Option<crate::connection::RecvMessageCallback>>,
    connection_cb: Mutex<Option<crate::connection::ConnectionCallback>>,
    write_complete_cb: Mutex<Option<crate::connection::WriteCompleteCallback>>,
    retry: AtomicBool,
    connect: AtomicBool,
    weak_self: Weak<TcpClient>,
}

impl TcpClient {
    pub fn new(handle: LoopHandle, server_addr: InetAddr, name: &str) -> Arc<TcpClient> {
        let connector = Connector::new(handle.clone(), server_addr, false);
        let client = Arc::new_cyclic(|weak| TcpClient {
            handle,
            name: name.to_string(),
            connector: Arc::clone(&connector),
            conn: Mutex::new(None),
            recv_msg_cb: Mutex::new(None),
            connection_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(false),
            weak_self: weak.clone(),
        });
        let weak = Arc::downgrade(&client);
        connector.set_new_connection_callback(Box::new(move |fd| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(fd);
            }
        }));
        trace!("client {} targets {}", client.name, client.server_addr());
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> &InetAddr {
        self.connector.server_addr()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.conn.lock().unwrap().clone()
    }

    /// Retries failed dials with backoff and re-dials dropped connections.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Relaxed);
        self.connector.set_retry(true);
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

    /// Invoked when a dial attempt fails outright.
    pub fn set_connection_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.connector.set_error_callback(Arc::new(cb));
    }

    /// Starts dialing; safe from any thread.
    pub fn connect(&self) {
        if self.connect.swap(true, Ordering::AcqRel) {
            warn!("client {} is already connecting", self.name);
            return;
        }
        trace!("client {} connecting to {}", self.name, self.server_addr());
        self.connector.start();
    }

    /// Half-closes the live connection; the peer's close completes it.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.conn.lock().unwrap().as_ref() {
            conn.shutdown();
        }
    }

    /// Abandons dialing, leaving an established connection alone.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    /// Runs on the client loop with a freshly connected fd.
    fn new_connection(&self, fd: RawFd) {
        self.handle.assert_in_loop_thread();
        let _ = EventLoop::with_current(|event_loop| {
            let local = socket::local_addr(fd).unwrap_or_else(|_| InetAddr::unspecified());
            let peer = socket::peer_addr(fd).unwrap_or_else(|_| InetAddr::unspecified());
            let conn = TcpConnection::new(event_loop, fd, local, peer);

            if let Some(cb) = self.recv_msg_cb.lock().unwrap().clone() {
                conn.set_recv_msg_callback(cb);
            } else {
                conn.set_recv_msg_callback(Arc::new(|_conn, buffer: &mut MessageBuffer| {
                    buffer.retrieve_all();
                }));
            }
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                conn.set_write_complete_callback(cb);
            }
            let weak = self.weak_self.clone();
            conn.set_close_callback(Arc::new(move |conn| {
                if let Some(client) = weak.upgrade() {
                    client.remove_connection(conn);
                }
            }));

            *self.conn.lock().unwrap() = Some(Arc::clone(&conn));
            conn.connect_established();
        });
    }

    /// Runs on the client loop when the connection closes.
    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        self.handle.assert_in_loop_thread();
        self.conn.lock().unwrap().take();
        let to_destroy = Arc::clone(conn);
        self.handle.queue_in_loop(move || to_destroy.connect_destroyed());

        if self.retry.load(Ordering::Relaxed) && self.connect.load(Ordering::Acquire) {
            info!(
                "client {} reconnecting to {}",
                self.name,
                self.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        // Leave an fd-owning connection to its own teardown; just stop any
        // dial in flight.
        self.connector.stop();
        trace!("client {} dropped", self.name);
    }
}
