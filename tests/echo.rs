use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

mod util;

#[test]
fn echo_round_trip() {
    let seen_len = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&seen_len);
    let (addr, handle, thread) = util::spawn_server(move |server| {
        server.set_recv_message_callback(move |conn, buffer| {
            observed.store(buffer.readable_bytes(), Ordering::SeqCst);
            let data = buffer.read_all();
            conn.send(&data);
        });
    });

    let mut stream = util::connect(addr);
    stream.write_all(b"hello").unwrap();
    let reply = util::read_exact_timeout(&mut stream, 5, Duration::from_secs(5));
    assert_eq!(reply, b"hello");
    assert_eq!(seen_len.load(Ordering::SeqCst), 5);

    drop(stream);
    handle.quit();
    thread.join().unwrap();
}

#[test]
fn length_prefixed_frame_round_trips() {
    // Receiver state machine: 8 bytes of big-endian length, then the body.
    let leftover = Arc::new(AtomicUsize::new(usize::MAX));
    let remaining = Arc::clone(&leftover);
    let (addr, handle, thread) = util::spawn_server(move |server| {
        server.set_recv_message_callback(move |conn, buffer| {
            while buffer.readable_bytes() >= 8 {
                let len = buffer.peek_u64() as usize;
                if buffer.readable_bytes() < 8 + len {
                    break;
                }
                let _ = buffer.read_u64();
                let body = buffer.read(len);
                conn.send(&body);
            }
            remaining.store(buffer.readable_bytes(), Ordering::SeqCst);
        });
    });

    // Sender frames by prepending the length to the assembled body.
    let mut frame = netloop::MessageBuffer::new();
    frame.push_back(b"hello world!");
    frame.push_front_u64(12);
    assert_eq!(frame.readable_bytes(), 20);

    let mut stream = util::connect(addr);
    stream.write_all(frame.peek()).unwrap();

    let reply = util::read_exact_timeout(&mut stream, 12, Duration::from_secs(5));
    assert_eq!(reply, b"hello world!");
    assert_eq!(leftover.load(Ordering::SeqCst), 0);

    drop(stream);
    handle.quit();
    thread.join().unwrap();
}

#[test]
fn sends_from_another_thread_stay_ordered() {
    let (conn_tx, conn_rx) = mpsc::channel();
    let conn_tx = Mutex::new(conn_tx);
    let (addr, handle, thread) = util::spawn_server(move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let _ = conn_tx.lock().unwrap().send(Arc::clone(conn));
            }
        });
    });

    let mut stream = util::connect(addr);
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Off-loop sends: each goes through the queued path, all in caller
    // order.
    for i in 0..50u8 {
        conn.send(&[b'a' + (i % 26)]);
    }
    let reply = util::read_exact_timeout(&mut stream, 50, Duration::from_secs(5));
    let expected: Vec<u8> = (0..50u8).map(|i| b'a' + (i % 26)).collect();
    assert_eq!(reply, expected);
    assert!(conn.bytes_sent() >= 50);

    drop(stream);
    drop(conn);
    handle.quit();
    thread.join().unwrap();
}

#[test]
fn peer_close_disconnects_the_connection() {
    let (event_tx, event_rx) = mpsc::channel::<bool>();
    let event_tx = Mutex::new(event_tx);
    let (addr, handle, thread) = util::spawn_server(move |server| {
        server.set_connection_callback(move |conn| {
            let _ = event_tx.lock().unwrap().send(conn.connected());
        });
    });

    let stream = util::connect(addr);
    assert!(event_rx.recv_timeout(Duration::from_secs(5)).unwrap());

    drop(stream);
    // The disconnect callback observes the Disconnected state.
    assert!(!event_rx.recv_timeout(Duration::from_secs(5)).unwrap());

    handle.quit();
    thread.join().unwrap();
}
