use std::any::Any;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::channel::ChannelRef;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::socket::{self, Socket};
use crate::wheel::{TimingWheel, WheelEntry};
use crate::{InetAddr, MessageBuffer, Token};

/// Shared reference to a connection: the server's connection set, the
/// channel tie and in-flight callbacks all hold one.
pub type TcpConnectionPtr = Arc<TcpConnection>;

pub(crate) type RecvMessageCallback =
    Arc<dyn Fn(&TcpConnectionPtr, &mut MessageBuffer) + Send + Sync>;
pub(crate) type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub(crate) type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub(crate) type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Size of the reusable staging buffer for file and stream sends.
const STAGING_LEN: usize = 16 * 1024;

/// Connection lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Constructed, not yet registered for reading.
    Connecting = 0,
    /// Full-duplex traffic.
    Connected = 1,
    /// Shutdown requested while writes were still queued.
    Disconnecting = 2,
    /// Closed; no further callbacks.
    Disconnected = 3,
}

fn state_from(raw: u8) -> ConnState {
    match raw {
        0 => ConnState::Connecting,
        1 => ConnState::Connected,
        2 => ConnState::Disconnecting,
        _ => ConnState::Disconnected,
    }
}

/// One element of the outbound pipeline: bytes, a file span, or a lazy
/// producer.
///
/// Dropping a node releases its resources: the file handle closes and a
/// stream producer is invoked once with `None` as the cleanup signal, so a
/// producer that opened files of its own can close them even when the
/// connection dies mid-stream.
enum BufferNode {
    Buffer(MessageBuffer),
    File {
        file: File,
        offset: u64,
        remaining: u64,
    },
    Stream {
        producer: Option<Box<dyn FnMut(Option<&mut [u8]>) -> usize + Send>>,
        finished: bool,
    },
}

impl Drop for BufferNode {
    fn drop(&mut self) {
        if let BufferNode::Stream { producer, .. } = self {
            if let Some(mut producer) = producer.take() {
                producer(None);
            }
        }
    }
}

/// An entry whose destruction force-closes its connection; inserting one
/// into the timing wheel arms the idle kick-off, re-inserting it postpones
/// the kick.
pub(crate) struct KickoffEntry {
    conn: Weak<TcpConnection>,
}

impl Drop for KickoffEntry {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            trace!("kicking off idle connection {}", conn.name());
            conn.force_close();
        }
    }
}

/// A full-duplex TCP connection bound to one event loop.
///
/// The read path scatter-reads into a receive buffer and hands it to the
/// message callback; the write path tries the socket directly and spills
/// the rest into a FIFO of [`BufferNode`]s drained on writability. All I/O
/// and all user-visible callbacks happen on the owning loop thread, in
/// socket order; `send` may be called from any thread and preserves the
/// caller's ordering.
pub struct TcpConnection {
    handle: LoopHandle,
    token: Token,
    socket: Socket,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    name: String,
    state: AtomicU8,
    recv_buffer: Mutex<MessageBuffer>,
    write_queue: Mutex<VecDeque<BufferNode>>,
    // Reused across file/stream sends; holds a stream's unwritten tail
    // between writability events.
    staging: Mutex<Vec<u8>>,
    // In-flight counter of queued sends. While non-zero, even loop-thread
    // sends are queued, preserving cross-thread caller order.
    send_num: Mutex<usize>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    recv_msg_cb: Mutex<Option<RecvMessageCallback>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water: Mutex<Option<(HighWaterMarkCallback, usize)>>,
    close_cb: Mutex<Option<CloseCallback>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    idle_timeout: Mutex<Duration>,
    kickoff_entry: Mutex<Weak<KickoffEntry>>,
    wheel: Mutex<Weak<TimingWheel>>,
    last_wheel_bump: Mutex<Instant>,
    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Wraps an established (accepted or connected) fd. The channel's
    /// callbacks are wired here; reading starts at
    /// [`connect_established`](TcpConnection::connect_established).
    pub(crate) fn new(
        event_loop: &EventLoop,
        fd: RawFd,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> TcpConnectionPtr {
        trace!("new connection: {} -> {}", peer_addr, local_addr);
        let socket = Socket::from_accepted(fd);
        if let Err(err) = socket.set_keep_alive(true) {
            warn!("failed to enable keepalive on fd {}: {}", fd, err);
        }
        let token = event_loop.add_channel(fd);
        let name = format!("{}--{}", local_addr, peer_addr);

        let conn = Arc::new_cyclic(|weak| TcpConnection {
            handle: event_loop.handle(),
            token,
            socket,
            local_addr,
            peer_addr,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            recv_buffer: Mutex::new(MessageBuffer::new()),
            write_queue: Mutex::new(VecDeque::new()),
            staging: Mutex::new(Vec::new()),
            send_num: Mutex::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            recv_msg_cb: Mutex::new(None),
            connection_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water: Mutex::new(None),
            close_cb: Mutex::new(None),
            context: Mutex::new(None),
            idle_timeout: Mutex::new(Duration::ZERO),
            kickoff_entry: Mutex::new(Weak::new()),
            wheel: Mutex::new(Weak::new()),
            last_wheel_bump: Mutex::new(Instant::now()),
            weak_self: weak.clone(),
        });

        let channel = event_loop.channel(token);
        let weak = Arc::downgrade(&conn);
        channel.set_read_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        });
        let weak = Arc::downgrade(&conn);
        channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Arc::downgrade(&conn);
        channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Arc::downgrade(&conn);
        channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        conn
    }

    // ===== facade =====

    pub fn local_addr(&self) -> &InetAddr {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &InetAddr {
        &self.peer_addr
    }

    /// `"local--peer"`, for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnState {
        state_from(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    /// Total bytes handed to the kernel on this connection; monotonic.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes read off this connection; monotonic.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// The loop this connection lives on.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_nodelay(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.socket.set_keep_alive(on)
    }

    /// Stores an opaque user value on the connection.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    /// Borrows the stored context, downcast to `T`.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut context = self.context.lock().unwrap();
        f(context.as_mut().and_then(|ctx| ctx.downcast_mut::<T>()))
    }

    /// Notifies `cb` whenever a single queued buffer exceeds `mark` bytes;
    /// the application should stop sending until the write-complete
    /// callback reports the queue drained.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        *self.high_water.lock().unwrap() = Some((Arc::new(cb), mark));
    }

    // ===== sending =====

    /// Sends bytes, from any thread. Data that does not fit the socket
    /// right away is buffered and drained on writability; the peer observes
    /// all of one `send` before any of the next, per calling thread.
    pub fn send(&self, data: &[u8]) {
        if self.handle.is_in_loop_thread() {
            let deferred = {
                let mut send_num = self.send_num.lock().unwrap();
                if *send_num == 0 {
                    false
                } else {
                    *send_num += 1;
                    true
                }
            };
            if !deferred {
                self.send_in_loop(data);
                return;
            }
            let copy = data.to_vec();
            let conn = self.to_arc();
            self.handle.queue_in_loop(move || {
                conn.send_in_loop(&copy);
                conn.dec_send_num();
            });
        } else {
            let copy = data.to_vec();
            let conn = self.to_arc();
            *self.send_num.lock().unwrap() += 1;
            self.handle.queue_in_loop(move || {
                conn.send_in_loop(&copy);
                conn.dec_send_num();
            });
        }
    }

    /// [`send`](TcpConnection::send) for an already-assembled buffer,
    /// moving it instead of copying.
    pub fn send_buffer(&self, buffer: MessageBuffer) {
        if self.handle.is_in_loop_thread() {
            let deferred = {
                let mut send_num = self.send_num.lock().unwrap();
                if *send_num == 0 {
                    false
                } else {
                    *send_num += 1;
                    true
                }
            };
            if !deferred {
                self.send_in_loop(buffer.peek());
                return;
            }
        } else {
            *self.send_num.lock().unwrap() += 1;
        }
        let conn = self.to_arc();
        self.handle.queue_in_loop(move || {
            conn.send_in_loop(buffer.peek());
            conn.dec_send_num();
        });
    }

    /// Queues a span of `path` for sending; `length` 0 means to the end of
    /// the file. On Linux the span goes out through `sendfile(2)`.
    pub fn send_file<P: AsRef<Path>>(&self, path: P, offset: u64, length: u64) -> io::Result<()> {
        let file = File::open(path.as_ref())?;
        let length = if length == 0 {
            file.metadata()?.len().saturating_sub(offset)
        } else {
            length
        };
        if length == 0 {
            return Ok(());
        }
        self.enqueue_node(BufferNode::File {
            file,
            offset,
            remaining: length,
        });
        Ok(())
    }

    /// Queues a producer-driven stream.
    ///
    /// The producer is called with `Some(dst)` to fill the next chunk and
    /// returns the number of bytes written; 0 ends the stream. It is called
    /// once more with `None` when the node is dropped, as the cleanup
    /// signal. The producer must not call back into this connection.
    pub fn send_stream(&self, producer: impl FnMut(Option<&mut [u8]>) -> usize + Send + 'static) {
        self.enqueue_node(BufferNode::Stream {
            producer: Some(Box::new(producer)),
            finished: false,
        });
    }

    fn enqueue_node(&self, node: BufferNode) {
        if self.handle.is_in_loop_thread() {
            let deferred = {
                let mut send_num = self.send_num.lock().unwrap();
                if *send_num == 0 {
                    false
                } else {
                    *send_num += 1;
                    true
                }
            };
            if !deferred {
                self.push_node_in_loop(node);
                return;
            }
        } else {
            *self.send_num.lock().unwrap() += 1;
        }
        let conn = self.to_arc();
        self.handle.queue_in_loop(move || {
            conn.push_node_in_loop(node);
            conn.dec_send_num();
        });
    }

    fn push_node_in_loop(&self, node: BufferNode) {
        let is_only_node = {
            let mut queue = self.write_queue.lock().unwrap();
            queue.push_back(node);
            queue.len() == 1
        };
        // Nothing ahead of it: start sending now instead of waiting for a
        // writability event that may never come.
        if is_only_node {
            self.send_file_in_loop();
        }
    }

    fn dec_send_num(&self) {
        *self.send_num.lock().unwrap() -= 1;
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.handle.assert_in_loop_thread();
        if self.state() != ConnState::Connected {
            warn!("connection {} is not connected, giving up sending", self.name);
            return;
        }
        self.extend_life();

        let mut sent = 0;
        let idle = !self.with_channel(|ch| ch.is_writing())
            && self.write_queue.lock().unwrap().is_empty();
        if idle {
            // Nothing queued: try the socket directly.
            match socket::write(self.socket.fd(), data) {
                Ok(n) => {
                    sent = n;
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    if log_write_error(&err, "send") {
                        return;
                    }
                }
            }
        }

        let remaining = data.len() - sent;
        if remaining > 0 && self.state() == ConnState::Connected {
            let queued = {
                let mut queue = self.write_queue.lock().unwrap();
                // Coalesce into a trailing byte buffer; a file or stream
                // node may not be appended to.
                if !matches!(queue.back(), Some(BufferNode::Buffer(_))) {
                    queue.push_back(BufferNode::Buffer(MessageBuffer::new()));
                }
                match queue.back_mut() {
                    Some(BufferNode::Buffer(buffer)) => {
                        buffer.push_back(&data[sent..]);
                        buffer.readable_bytes()
                    }
                    _ => unreachable!(),
                }
            };
            self.with_channel(|ch| {
                if !ch.is_writing() {
                    ch.enable_writing();
                }
            });
            let high_water = self.high_water.lock().unwrap().clone();
            if let Some((cb, mark)) = high_water {
                if queued > mark {
                    cb(&self.to_arc(), queued);
                }
            }
        }
    }

    // ===== readiness handlers =====

    fn handle_read(&self) {
        self.handle.assert_in_loop_thread();
        let result = {
            let mut buffer = self.recv_buffer.lock().unwrap();
            buffer.read_fd(self.socket.fd())
        };
        match result {
            // Socket closed by the peer.
            Ok(0) => self.handle_close(),
            Ok(n) => {
                self.extend_life();
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                let cb = self.recv_msg_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    let conn = self.to_arc();
                    let mut buffer = self.recv_buffer.lock().unwrap();
                    cb(&conn, &mut buffer);
                }
            }
            Err(err) => match err.raw_os_error() {
                Some(libc::EAGAIN) => {}
                // Peer-initiated close, same as reading the EOF.
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                    trace!("read on {}: peer reset", self.name);
                    self.handle_close();
                }
                _ => {
                    error!("read on {} failed: {}", self.name, err);
                    self.handle_close();
                }
            },
        }
    }

    fn handle_write(&self) {
        self.handle.assert_in_loop_thread();
        self.extend_life();
        if !self.with_channel(|ch| ch.is_writing()) {
            error!("connection {}: write event without write interest", self.name);
            return;
        }

        enum Step {
            Finished,
            WriteBuffer,
            SendFile,
        }
        let step = {
            let mut queue = self.write_queue.lock().unwrap();
            match queue.front_mut() {
                None => {
                    debug_assert!(false, "writable with an empty write queue");
                    return;
                }
                Some(BufferNode::Buffer(buffer)) => {
                    if buffer.readable_bytes() == 0 {
                        Step::Finished
                    } else {
                        Step::WriteBuffer
                    }
                }
                Some(BufferNode::File { remaining, .. }) => {
                    if *remaining == 0 {
                        Step::Finished
                    } else {
                        Step::SendFile
                    }
                }
                Some(BufferNode::Stream { finished, .. }) => {
                    if *finished && self.staging.lock().unwrap().is_empty() {
                        Step::Finished
                    } else {
                        Step::SendFile
                    }
                }
            }
        };
        match step {
            Step::Finished => self.finish_head_node(),
            Step::WriteBuffer => self.write_head_buffer(),
            Step::SendFile => self.send_file_in_loop(),
        }
    }

    /// Pops the completed head node; an emptied queue stops the write
    /// interest, reports write-complete and finishes a pending shutdown.
    fn finish_head_node(&self) {
        let empty_now = {
            let mut queue = self.write_queue.lock().unwrap();
            queue.pop_front();
            queue.is_empty()
        };
        if empty_now {
            self.with_channel(|ch| {
                if ch.is_writing() {
                    ch.disable_writing();
                }
            });
            let cb = self.write_complete_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(&self.to_arc());
            }
            if self.state() == ConnState::Disconnecting {
                let _ = self.socket.shutdown_write();
            }
        } else {
            self.send_next();
        }
    }

    fn send_next(&self) {
        let head_is_buffer = matches!(
            self.write_queue.lock().unwrap().front(),
            Some(BufferNode::Buffer(_))
        );
        if head_is_buffer {
            self.write_head_buffer();
        } else {
            self.send_file_in_loop();
        }
    }

    fn write_head_buffer(&self) {
        let result = {
            let mut queue = self.write_queue.lock().unwrap();
            let Some(BufferNode::Buffer(buffer)) = queue.front_mut() else {
                return;
            };
            match socket::write(self.socket.fd(), buffer.peek()) {
                Ok(n) => {
                    buffer.retrieve(n);
                    Ok(n)
                }
                Err(err) => Err(err),
            }
        };
        match result {
            Ok(n) => {
                self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(err) => {
                let _ = log_write_error(&err, "send buffered data");
            }
        }
    }

    /// Drives the head file/stream node.
    fn send_file_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        enum Kind {
            File,
            Stream,
        }
        let kind = {
            let queue = self.write_queue.lock().unwrap();
            match queue.front() {
                Some(BufferNode::File { .. }) => Kind::File,
                Some(BufferNode::Stream { .. }) => Kind::Stream,
                _ => return,
            }
        };
        match kind {
            Kind::Stream => self.send_stream_in_loop(),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Kind::File => self.send_file_zero_copy(),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Kind::File => self.send_file_staged(),
        }
    }

    /// File node on Linux: hand the span to the kernel.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn send_file_zero_copy(&self) {
        use std::os::fd::AsRawFd;

        let fatal = {
            let mut queue = self.write_queue.lock().unwrap();
            let Some(BufferNode::File {
                file,
                offset,
                remaining,
            }) = queue.front_mut()
            else {
                return;
            };
            let mut off = *offset as libc::off_t;
            match syscall!(sendfile(
                self.socket.fd(),
                file.as_raw_fd(),
                &mut off,
                *remaining as usize
            )) {
                Ok(n) => {
                    trace!("sendfile: {} bytes sent", n);
                    *offset = off as u64;
                    *remaining -= n as u64;
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    false
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        false
                    } else {
                        error!("sendfile on {} failed: {}", self.name, err);
                        true
                    }
                }
            }
        };
        if fatal {
            self.with_channel(|ch| {
                if ch.is_writing() {
                    ch.disable_writing();
                }
            });
            return;
        }
        self.with_channel(|ch| {
            if !ch.is_writing() {
                ch.enable_writing();
            }
        });
    }

    /// File node without `sendfile`: read a 16 KiB chunk, write it out,
    /// repeat until the socket pushes back.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn send_file_staged(&self) {
        use std::io::{Read, Seek, SeekFrom};

        enum Outcome {
            KeepWriting,
            Fatal,
            ReadError,
        }
        let outcome = {
            let mut queue = self.write_queue.lock().unwrap();
            let Some(BufferNode::File {
                file,
                offset,
                remaining,
            }) = queue.front_mut()
            else {
                return;
            };
            let mut staging = self.staging.lock().unwrap();
            let mut outcome = Outcome::KeepWriting;
            if let Err(err) = file.seek(SeekFrom::Start(*offset)) {
                error!("seek in outgoing file failed: {}", err);
                outcome = Outcome::ReadError;
            } else {
                while *remaining > 0 {
                    let want = STAGING_LEN.min(*remaining as usize);
                    staging.resize(want, 0);
                    match file.read(&mut staging[..want]) {
                        Ok(0) => {
                            error!("outgoing file truncated under the connection");
                            outcome = Outcome::ReadError;
                            break;
                        }
                        Ok(n) => match socket::write(self.socket.fd(), &staging[..n]) {
                            Ok(sent) => {
                                *remaining -= sent as u64;
                                *offset += sent as u64;
                                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                                if sent < n {
                                    // Socket buffer full; pick it up on the
                                    // next writability event.
                                    break;
                                }
                            }
                            Err(err) => {
                                if log_write_error(&err, "send file") {
                                    outcome = Outcome::Fatal;
                                }
                                break;
                            }
                        },
                        Err(err) => {
                            error!("read from outgoing file failed: {}", err);
                            outcome = Outcome::ReadError;
                            break;
                        }
                    }
                }
            }
            staging.clear();
            outcome
        };
        match outcome {
            Outcome::Fatal => {}
            Outcome::ReadError => {
                self.with_channel(|ch| {
                    if ch.is_writing() {
                        ch.disable_writing();
                    }
                });
            }
            Outcome::KeepWriting => {
                self.with_channel(|ch| {
                    if !ch.is_writing() {
                        ch.enable_writing();
                    }
                });
            }
        }
    }

    /// Stream node: pull chunks from the producer through the staging
    /// buffer; a partial write parks the tail in staging.
    fn send_stream_in_loop(&self) {
        let fatal = {
            let mut queue = self.write_queue.lock().unwrap();
            let Some(BufferNode::Stream { producer, finished }) = queue.front_mut() else {
                return;
            };
            let mut staging = self.staging.lock().unwrap();
            let mut fatal = false;
            loop {
                if staging.is_empty() {
                    if *finished {
                        break;
                    }
                    staging.resize(STAGING_LEN, 0);
                    let n = match producer.as_mut() {
                        Some(producer) => producer(Some(&mut staging[..])),
                        None => 0,
                    };
                    staging.truncate(n);
                    if n == 0 {
                        trace!("stream on {} finished", self.name);
                        *finished = true;
                        break;
                    }
                }
                match socket::write(self.socket.fd(), &staging) {
                    Ok(n) => {
                        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                        if n < staging.len() {
                            staging.drain(..n);
                            break;
                        }
                        staging.clear();
                    }
                    Err(err) => {
                        if log_write_error(&err, "send stream") {
                            fatal = true;
                        }
                        break;
                    }
                }
            }
            fatal
        };
        if fatal {
            return;
        }
        self.with_channel(|ch| {
            if !ch.is_writing() {
                ch.enable_writing();
            }
        });
    }

    fn handle_close(&self) {
        trace!("connection {} closed, fd={}", self.name, self.socket.fd());
        self.handle.assert_in_loop_thread();
        self.set_state(ConnState::Disconnected);
        self.with_channel(|ch| ch.disable_all());
        let conn = self.to_arc();
        let cb = self.connection_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(&conn);
        }
        let cb = self.close_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(&conn);
        }
    }

    fn handle_error(&self) {
        match socket::take_error(self.socket.fd()) {
            Ok(0) => {}
            Ok(err) => trace!("connection {}: SO_ERROR = {}", self.name, err),
            Err(err) => trace!("connection {}: error query failed: {}", self.name, err),
        }
    }

    // ===== lifecycle =====

    /// Registers reading, flips to `Connected` and fires the connection
    /// callback; runs on the loop thread.
    pub(crate) fn connect_established(&self) {
        let conn = self.to_arc();
        self.handle.run_in_loop(move || {
            trace!("connection {} established", conn.name);
            debug_assert_eq!(conn.state(), ConnState::Connecting);
            conn.with_channel(|ch| {
                ch.tie(&conn);
                ch.enable_reading();
            });
            conn.set_state(ConnState::Connected);
            let cb = conn.connection_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(&conn);
            }
        });
    }

    /// Final teardown on the loop thread; removes the channel. Reports the
    /// disconnect when the close path has not already done so.
    pub(crate) fn connect_destroyed(&self) {
        self.handle.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.with_channel(|ch| ch.disable_all());
            let cb = self.connection_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(&self.to_arc());
            }
        }
        self.with_channel(|ch| {
            ch.disable_all();
            ch.remove();
        });
    }

    /// Half-closes once all queued writes drain; the read side stays open
    /// until the peer closes.
    pub fn shutdown(&self) {
        let conn = self.to_arc();
        self.handle.run_in_loop(move || {
            if conn.state() == ConnState::Connected {
                conn.set_state(ConnState::Disconnecting);
                if !conn.with_channel(|ch| ch.is_writing()) {
                    let _ = conn.socket.shutdown_write();
                }
            }
        });
    }

    /// Closes now, queued writes included. Idempotent.
    pub fn force_close(&self) {
        let conn = self.to_arc();
        self.handle.run_in_loop(move || {
            if matches!(
                conn.state(),
                ConnState::Connected | ConnState::Disconnecting
            ) {
                conn.set_state(ConnState::Disconnecting);
                conn.handle_close();
            }
        });
    }

    /// Arms the idle kick-off: after `timeout` with no traffic the wheel
    /// drops the entry and the entry's drop force-closes the connection.
    pub(crate) fn enable_kicking_off(&self, timeout: Duration, wheel: &Arc<TimingWheel>) {
        let entry = Arc::new(KickoffEntry {
            conn: self.weak_self.clone(),
        });
        *self.kickoff_entry.lock().unwrap() = Arc::downgrade(&entry);
        *self.wheel.lock().unwrap() = Arc::downgrade(wheel);
        *self.idle_timeout.lock().unwrap() = timeout;
        let entry: WheelEntry = entry;
        wheel.insert_entry(timeout, entry);
    }

    /// Pushes the kick-off deadline out on traffic, rate-limited to once a
    /// second so busy connections do not hammer the wheel.
    fn extend_life(&self) {
        let timeout = *self.idle_timeout.lock().unwrap();
        if timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        {
            let mut last = self.last_wheel_bump.lock().unwrap();
            if now < *last + Duration::from_secs(1) {
                return;
            }
            *last = now;
        }
        let entry = self.kickoff_entry.lock().unwrap().upgrade();
        let wheel = self.wheel.lock().unwrap().upgrade();
        if let (Some(entry), Some(wheel)) = (entry, wheel) {
            let entry: WheelEntry = entry;
            wheel.insert_entry(timeout, entry);
        }
    }

    pub(crate) fn set_recv_msg_callback(&self, cb: RecvMessageCallback) {
        *self.recv_msg_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn to_arc(&self) -> TcpConnectionPtr {
        self.weak_self
            .upgrade()
            .expect("connection outlived its last strong reference")
    }

    fn with_channel<R>(&self, f: impl FnOnce(ChannelRef<'_>) -> R) -> R {
        let token = self.token;
        self.handle.with(|event_loop| f(event_loop.channel(token)))
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Classifies a failed socket write. Returns true when the attempt is over
/// for good: the peer is gone or the error is unexpected. A full socket
/// buffer returns false; the write resumes on the next readiness event.
fn log_write_error(err: &io::Error, op: &str) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        trace!("{}: socket buffer full", op);
        return false;
    }
    match err.raw_os_error() {
        Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
            trace!("{}: connection closed by peer", op);
            true
        }
        _ => {
            error!("{}: unexpected error: {}", op, err);
            true
        }
    }
}
