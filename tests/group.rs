use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use netloop::{
    quit_all_event_loops, Dialer, EventLoopGroup, Handler, Listener, MessageBuffer,
    TcpConnectionPtr,
};

mod util;

struct Upper;

impl Handler for Upper {
    fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
        let data = buffer.read_all();
        let upper: Vec<u8> = data.iter().map(|b| b.to_ascii_uppercase()).collect();
        conn.send(&upper);
    }
}

struct Probe {
    replies: Mutex<mpsc::Sender<Vec<u8>>>,
    connects: Arc<AtomicUsize>,
}

impl Handler for Probe {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        if conn.connected() {
            self.connects.fetch_add(1, Ordering::SeqCst);
            conn.send(b"hello loops");
        }
    }

    fn on_message(&self, _conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
        let _ = self.replies.lock().unwrap().send(buffer.read_all());
    }
}

#[test]
fn serve_and_dial_through_loop_groups() {
    util::init();
    let port = util::free_port();
    let addr: netloop::InetAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let server_thread = std::thread::spawn(move || {
        let listener = Listener::bind(addr).name("upper-server").with(Upper);
        EventLoopGroup::with_name(2, "server-loop")
            .serve(listener)
            .unwrap();
    });
    // Give the acceptor a moment to come up.
    std::thread::sleep(Duration::from_millis(300));

    let (reply_tx, reply_rx) = mpsc::channel();
    let connects = Arc::new(AtomicUsize::new(0));
    let probe = Probe {
        replies: Mutex::new(reply_tx),
        connects: Arc::clone(&connects),
    };

    let client_thread = std::thread::spawn(move || {
        let dialer = Dialer::connect_to(addr).name("probe").with(probe);
        EventLoopGroup::with_name(1, "client-loop")
            .dial(dialer)
            .unwrap();
    });

    let reply = reply_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no reply through the loop group");
    assert_eq!(reply, b"HELLO LOOPS");
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    quit_all_event_loops();
    server_thread.join().unwrap();
    client_thread.join().unwrap();
}
