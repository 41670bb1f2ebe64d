use std::io::{Read, Write};
use std::time::{Duration, Instant};

mod util;

// Kick-off granularity is whole wheel ticks (1 s) plus the rotation
// phase, so the deadline asserts are generous.

#[test]
fn idle_connection_is_kicked() {
    let (addr, handle, thread) = util::spawn_server(|server| {
        server.set_idle_timeout(Duration::from_secs(2));
    });

    let mut stream = util::connect(addr);
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Never send anything; the server must close us.
    let start = Instant::now();
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).expect("expected a clean close");
    assert_eq!(n, 0, "server should have closed the idle connection");
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_secs(1),
        "kicked too early: {:?}",
        elapsed
    );
    assert!(
        elapsed <= Duration::from_secs(6),
        "kicked too late: {:?}",
        elapsed
    );

    handle.quit();
    thread.join().unwrap();
}

#[test]
fn active_connection_stays_alive() {
    let (addr, handle, thread) = util::spawn_server(|server| {
        server.set_idle_timeout(Duration::from_secs(2));
        server.set_recv_message_callback(|_conn, buffer| {
            buffer.retrieve_all();
        });
    });

    let mut stream = util::connect(addr);
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    // A byte a second keeps the kick away, well past the idle timeout.
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(6) {
        stream.write_all(b"x").expect("connection was kicked");
        std::thread::sleep(Duration::from_secs(1));
    }

    // Still open: a read times out instead of returning EOF.
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => panic!("active connection was kicked"),
        Ok(_) => panic!("server sent unexpected data"),
        Err(err) => {
            assert!(
                matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ),
                "unexpected error: {}",
                err
            );
        }
    }

    drop(stream);
    handle.quit();
    thread.join().unwrap();
}
