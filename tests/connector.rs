use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use netloop::{EventLoopThread, TcpClient};

mod util;

#[test]
fn dial_without_retry_reports_the_error_once() {
    util::init();
    let port = util::free_port();

    let thread = EventLoopThread::new("dialer-once");
    thread.run();
    let client = TcpClient::new(
        thread.handle().clone(),
        format!("127.0.0.1:{}", port).parse().unwrap(),
        "no-retry",
    );

    let errors = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&errors);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    client.set_connection_error_callback(move || {
        hits.fetch_add(1, Ordering::SeqCst);
        let _ = tx.lock().unwrap().send(());
    });
    client.connect();

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // No retry: exactly one report, no further attempts.
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(client.connection().is_none());
}

#[test]
fn dial_with_retry_backs_off_until_the_server_appears() {
    util::init();
    let port = util::free_port();
    let target: netloop::InetAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let thread = EventLoopThread::new("dialer-retry");
    thread.run();
    let client = TcpClient::new(thread.handle().clone(), target, "with-retry");
    client.enable_retry();

    let (conn_tx, conn_rx) = mpsc::channel();
    let conn_tx = Mutex::new(conn_tx);
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            let _ = conn_tx.lock().unwrap().send(Instant::now());
        }
    });

    let started = Instant::now();
    client.connect();

    // Let the first attempts (at ~0, 0.5 s, 1.5 s) fail, then open the
    // port for real; a later backed-off attempt must land.
    std::thread::sleep(Duration::from_millis(1800));
    let (server_tx, server_rx) = mpsc::channel();
    let server_thread = std::thread::spawn(move || {
        let event_loop = netloop::EventLoop::new().unwrap();
        let server =
            netloop::TcpServer::new(&event_loop, target, "late-server", true, true).unwrap();
        server_tx
            .send(event_loop.handle())
            .unwrap();
        server.start();
        event_loop.run();
    });
    let server_handle = server_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let connected_at = conn_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("retry never reached the late server");
    assert!(connected_at - started >= Duration::from_millis(1800));

    client.disconnect();
    server_handle.quit();
    server_thread.join().unwrap();
}
