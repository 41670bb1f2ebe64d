use std::io;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::error;

use crate::client::TcpClient;
use crate::connection::TcpConnectionPtr;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::EventLoopThreadPool;
use crate::server::TcpServer;
use crate::{InetAddr, MessageBuffer};

/// The application-side hooks of a bound service.
///
/// Every method has a default body, so a handler implements only the subset
/// it cares about; the framework calls straight through the trait object.
/// All hooks run on the loop that owns the connection.
pub trait Handler: Send + Sync + 'static {
    /// Connection established or disconnected; check
    /// [`connected`](crate::TcpConnection::connected).
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        let _ = conn;
    }

    /// Bytes arrived. Framing is the handler's job: consume what is
    /// complete, leave the rest in `buffer` for the next call.
    fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
        let _ = conn;
        error!(
            "unhandled message of {} bytes, dropping",
            buffer.readable_bytes()
        );
        buffer.retrieve_all();
    }

    /// The write queue drained completely.
    fn on_write_complete(&self, conn: &TcpConnectionPtr) {
        let _ = conn;
    }

    /// A dial attempt failed outright (dialers only).
    fn on_connection_error(&self) {}
}

/// Builder binding a listening address to a [`Handler`].
///
/// # Examples
///
/// ```no_run
/// use netloop::{EventLoopGroup, Listener, Handler, MessageBuffer, TcpConnectionPtr};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
///         let data = buffer.read_all();
///         conn.send(&data);
///     }
/// }
///
/// let listener = Listener::bind("127.0.0.1:7000".parse().unwrap()).with(Echo);
/// EventLoopGroup::new(2).serve(listener).unwrap();
/// ```
pub struct Listener {
    addr: InetAddr,
    name: String,
    reuse_addr: bool,
    reuse_port: bool,
    idle_timeout: Duration,
    handler: Option<Arc<dyn Handler>>,
}

impl Listener {
    pub fn bind(addr: InetAddr) -> Listener {
        Listener {
            addr,
            name: "tcp-listener".to_string(),
            reuse_addr: true,
            reuse_port: true,
            idle_timeout: Duration::ZERO,
            handler: None,
        }
    }

    pub fn name(mut self, name: &str) -> Listener {
        self.name = name.to_string();
        self
    }

    /// Installs the handler.
    pub fn with<H: Handler>(mut self, handler: H) -> Listener {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// An idle connection is one with no reads and no writes; kick it off
    /// `timeout` after it went quiet.
    pub fn enable_kickoff_idle(mut self, timeout: Duration) -> Listener {
        self.idle_timeout = timeout;
        self
    }

    pub fn reuse_addr(mut self, on: bool) -> Listener {
        self.reuse_addr = on;
        self
    }

    pub fn reuse_port(mut self, on: bool) -> Listener {
        self.reuse_port = on;
        self
    }
}

/// Builder binding a dial target to a [`Handler`].
pub struct Dialer {
    addr: InetAddr,
    name: String,
    retry: bool,
    handler: Option<Arc<dyn Handler>>,
}

impl Dialer {
    pub fn connect_to(addr: InetAddr) -> Dialer {
        Dialer {
            addr,
            name: "tcp-dialer".to_string(),
            retry: false,
            handler: None,
        }
    }

    pub fn name(mut self, name: &str) -> Dialer {
        self.name = name.to_string();
        self
    }

    /// Installs the handler.
    pub fn with<H: Handler>(mut self, handler: H) -> Dialer {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Failed dials back off and retry; dropped connections re-dial.
    pub fn enable_retry(mut self) -> Dialer {
        self.retry = true;
        self
    }
}

/// A main loop plus a pool of io loops, driving listeners and dialers.
pub struct EventLoopGroup {
    pool: Arc<EventLoopThreadPool>,
}

impl EventLoopGroup {
    pub fn new(thread_num: usize) -> EventLoopGroup {
        EventLoopGroup::with_name(thread_num, "event-loop")
    }

    pub fn with_name(thread_num: usize, name: &str) -> EventLoopGroup {
        EventLoopGroup {
            pool: Arc::new(EventLoopThreadPool::new(thread_num, name)),
        }
    }

    pub fn pool(&self) -> &Arc<EventLoopThreadPool> {
        &self.pool
    }

    /// Runs `listener` with the calling thread as the acceptor loop and
    /// the pool as io loops. Blocks until the loop quits (see
    /// [`quit_all_event_loops`]).
    pub fn serve(&self, listener: Listener) -> io::Result<()> {
        let event_loop = EventLoop::new()?;
        register_loop(event_loop.handle());
        for handle in self.pool.handles() {
            register_loop(handle.clone());
        }

        let server = TcpServer::new(
            &event_loop,
            listener.addr,
            &listener.name,
            listener.reuse_addr,
            listener.reuse_port,
        )?;
        if let Some(handler) = listener.handler {
            let h = Arc::clone(&handler);
            server.set_recv_message_callback(move |conn, buffer| h.on_message(conn, buffer));
            let h = Arc::clone(&handler);
            server.set_connection_callback(move |conn| h.on_connection(conn));
            let h = Arc::clone(&handler);
            server.set_write_complete_callback(move |conn| h.on_write_complete(conn));
        }
        if !listener.idle_timeout.is_zero() {
            server.set_idle_timeout(listener.idle_timeout);
        }
        if !self.pool.is_empty() {
            server.set_io_loop_pool(Arc::clone(&self.pool));
        }

        self.pool.start();
        server.start();
        event_loop.run();
        Ok(())
    }

    /// [`serve`](EventLoopGroup::serve) on a thread of its own, for
    /// embedding the group in a larger process.
    pub fn serve_in_background(
        self,
        listener: Listener,
    ) -> std::thread::JoinHandle<io::Result<()>> {
        std::thread::Builder::new()
            .name("netloop-serve".to_string())
            .spawn(move || self.serve(listener))
            .expect("failed to spawn serve thread")
    }

    /// Dials `dialer` on the next pool loop and blocks on the pool.
    pub fn dial(&self, dialer: Dialer) -> io::Result<()> {
        let handle = self
            .pool
            .next_loop()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty loop pool"))?;
        for handle in self.pool.handles() {
            register_loop(handle.clone());
        }

        let client = TcpClient::new(handle, dialer.addr, &dialer.name);
        if let Some(handler) = dialer.handler {
            let h = Arc::clone(&handler);
            client.set_recv_message_callback(move |conn, buffer| h.on_message(conn, buffer));
            let h = Arc::clone(&handler);
            client.set_connection_callback(move |conn| h.on_connection(conn));
            let h = Arc::clone(&handler);
            client.set_write_complete_callback(move |conn| h.on_write_complete(conn));
            let h = Arc::clone(&handler);
            client.set_connection_error_callback(move || h.on_connection_error());
        }
        if dialer.retry {
            client.enable_retry();
        }

        client.connect();
        self.pool.start();
        self.pool.wait();
        Ok(())
    }
}

static ALL_LOOPS: OnceLock<Mutex<Vec<LoopHandle>>> = OnceLock::new();

fn register_loop(handle: LoopHandle) {
    ALL_LOOPS
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap()
        .push(handle);
}

/// Quits every loop a group ever started. The usual way to bring a whole
/// process down from a signal handler or an admin command.
pub fn quit_all_event_loops() {
    if let Some(loops) = ALL_LOOPS.get() {
        for handle in loops.lock().unwrap().iter() {
            handle.quit();
        }
    }
}
