use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod util;

fn temp_file(name: &str, content: &[u8]) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("netloop-test-{}-{}", std::process::id(), name));
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn send_file_delivers_the_whole_file() {
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let path = temp_file("whole", &content);

    let served = path.clone();
    let (addr, handle, thread) = util::spawn_server(move |server| {
        let served = served.clone();
        server.set_recv_message_callback(move |conn, buffer| {
            buffer.retrieve_all();
            conn.send_file(&served, 0, 0).unwrap();
        });
    });

    let mut stream = util::connect(addr);
    stream.write_all(b"go").unwrap();
    let reply = util::read_exact_timeout(&mut stream, content.len(), Duration::from_secs(10));
    assert_eq!(reply, content);

    drop(stream);
    handle.quit();
    thread.join().unwrap();
    let _ = std::fs::remove_file(path);
}

#[test]
fn send_file_honors_offset_and_length() {
    let content: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();
    let path = temp_file("span", &content);

    let served = path.clone();
    let (addr, handle, thread) = util::spawn_server(move |server| {
        let served = served.clone();
        server.set_recv_message_callback(move |conn, buffer| {
            buffer.retrieve_all();
            conn.send_file(&served, 1000, 2000).unwrap();
        });
    });

    let mut stream = util::connect(addr);
    stream.write_all(b"go").unwrap();
    let reply = util::read_exact_timeout(&mut stream, 2000, Duration::from_secs(10));
    assert_eq!(reply, content[1000..3000]);

    drop(stream);
    handle.quit();
    thread.join().unwrap();
    let _ = std::fs::remove_file(path);
}

#[test]
fn send_stream_produces_until_end_and_gets_the_cleanup_signal() {
    const CHUNK: usize = 10_000;
    const CHUNKS: usize = 10;

    let cleaned = Arc::new(AtomicBool::new(false));
    let cleanup = Arc::clone(&cleaned);
    let (addr, handle, thread) = util::spawn_server(move |server| {
        let cleanup = Arc::clone(&cleanup);
        server.set_recv_message_callback(move |conn, buffer| {
            buffer.retrieve_all();
            let cleanup = Arc::clone(&cleanup);
            let produced = AtomicUsize::new(0);
            conn.send_stream(move |dst| match dst {
                Some(dst) => {
                    let n = produced.fetch_add(1, Ordering::SeqCst);
                    if n >= CHUNKS {
                        return 0;
                    }
                    for (i, byte) in dst.iter_mut().take(CHUNK).enumerate() {
                        *byte = ((n * CHUNK + i) % 241) as u8;
                    }
                    CHUNK
                }
                None => {
                    cleanup.store(true, Ordering::SeqCst);
                    0
                }
            });
        });
    });

    let mut stream = util::connect(addr);
    stream.write_all(b"go").unwrap();
    let reply = util::read_exact_timeout(&mut stream, CHUNK * CHUNKS, Duration::from_secs(10));
    let expected: Vec<u8> = (0..CHUNK * CHUNKS).map(|i| (i % 241) as u8).collect();
    assert_eq!(reply, expected);

    // The node pops once the stream drains; the producer hears about it.
    for _ in 0..50 {
        if cleaned.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(cleaned.load(Ordering::SeqCst));

    drop(stream);
    handle.quit();
    thread.join().unwrap();
}
