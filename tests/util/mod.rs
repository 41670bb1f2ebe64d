// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Once;
use std::thread;
use std::time::Duration;

use netloop::{EventLoop, InetAddr, LoopHandle, TcpServer};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Runs a server on a dedicated loop thread, returning its address, loop
/// handle and the join handle. `setup` configures the server before it
/// starts; quitting the loop ends the thread.
pub fn spawn_server(
    setup: impl FnOnce(&std::sync::Arc<TcpServer>) + Send + 'static,
) -> (InetAddr, LoopHandle, thread::JoinHandle<()>) {
    init();
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("failed to create event loop");
        let server = TcpServer::new(
            &event_loop,
            "127.0.0.1:0".parse().unwrap(),
            "test-server",
            true,
            true,
        )
        .expect("failed to bind server");
        setup(&server);
        tx.send((*server.addr(), event_loop.handle())).unwrap();
        server.start();
        event_loop.run();
    });
    let (addr, handle) = rx.recv().expect("server thread died during setup");
    (addr, handle, thread)
}

/// Runs a bare event loop on a dedicated thread.
pub fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    init();
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("failed to create event loop");
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let handle = rx.recv().expect("loop thread died during setup");
    (handle, thread)
}

pub fn connect(addr: InetAddr) -> TcpStream {
    let addr: SocketAddr = addr.into();
    TcpStream::connect(addr).expect("failed to connect to test server")
}

/// Reads exactly `n` bytes, failing the test after `timeout`.
pub fn read_exact_timeout(stream: &mut TcpStream, n: usize, timeout: Duration) -> Vec<u8> {
    stream
        .set_read_timeout(Some(timeout))
        .expect("failed to set read timeout");
    let mut buf = vec![0; n];
    stream.read_exact(&mut buf).expect("short read from server");
    buf
}

/// A port that nothing is listening on (bound briefly, then released).
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
