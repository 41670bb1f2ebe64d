use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod util;

const PAYLOAD: usize = 8 * 1024 * 1024;
const MARK: usize = 64 * 1024;

#[test]
fn big_send_signals_high_water_then_drains_to_write_complete() {
    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_level = Arc::new(AtomicUsize::new(0));
    let complete = Arc::new(AtomicBool::new(false));

    let hits = Arc::clone(&hwm_hits);
    let level = Arc::clone(&hwm_level);
    let done = Arc::clone(&complete);
    let (addr, handle, thread) = util::spawn_server(move |server| {
        let hits = Arc::clone(&hits);
        let level = Arc::clone(&level);
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                return;
            }
            let hits = Arc::clone(&hits);
            let level = Arc::clone(&level);
            conn.set_high_water_mark_callback(
                move |_conn, queued| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    level.fetch_max(queued, Ordering::SeqCst);
                },
                MARK,
            );
            // One oversized send into a peer that is not reading yet.
            conn.send(&vec![0x5a; PAYLOAD]);
        });
        let done = Arc::clone(&done);
        server.set_write_complete_callback(move |_conn| {
            done.store(true, Ordering::SeqCst);
        });
    });

    let mut stream = util::connect(addr);
    // Let the server hit the socket limit and queue the remainder.
    std::thread::sleep(Duration::from_millis(300));
    assert!(hwm_hits.load(Ordering::SeqCst) >= 1);
    assert!(hwm_level.load(Ordering::SeqCst) > MARK);
    assert!(!complete.load(Ordering::SeqCst));

    // Now drain: the queued bytes flow out and write-complete fires.
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut total = 0;
    let mut buf = vec![0u8; 64 * 1024];
    while total < PAYLOAD {
        let n = stream.read(&mut buf).expect("read stalled");
        assert!(n > 0, "server closed early");
        total += n;
    }
    assert_eq!(total, PAYLOAD);

    // The queue is empty once everything was read.
    for _ in 0..50 {
        if complete.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(complete.load(Ordering::SeqCst));

    drop(stream);
    handle.quit();
    thread.join().unwrap();
}
