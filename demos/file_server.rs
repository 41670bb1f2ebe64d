//! A minimal static file server, just enough HTTP to exercise
//! `send_file`: parse the request line, map the path under the served
//! root, stream the file, close.

use std::path::{Component, Path, PathBuf};

use log::{info, warn};
use netloop::{EventLoopGroup, Handler, Listener, MessageBuffer, TcpConnectionPtr};

struct FileServer {
    root: PathBuf,
}

impl FileServer {
    fn resolve(&self, raw: &str) -> Option<PathBuf> {
        let raw = raw.trim_start_matches('/');
        let raw = if raw.is_empty() { "index.html" } else { raw };
        let relative = Path::new(raw);
        // No escaping the root.
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }

    fn respond(&self, conn: &TcpConnectionPtr, target: &str) {
        let path = self.resolve(target);
        let meta = path.as_ref().and_then(|p| std::fs::metadata(p).ok());
        match (path, meta) {
            (Some(path), Some(meta)) if meta.is_file() => {
                let header = format!(
                    "HTTP/1.0 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    meta.len()
                );
                conn.send(header.as_bytes());
                if let Err(err) = conn.send_file(&path, 0, 0) {
                    warn!("failed to queue {}: {}", path.display(), err);
                }
            }
            _ => {
                let body = "not found\n";
                let header = format!(
                    "HTTP/1.0 404 Not Found\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                conn.send(header.as_bytes());
            }
        }
        // Half-close once the queue drains; the client's close finishes it.
        conn.shutdown();
    }
}

impl Handler for FileServer {
    fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
        let Some(line_end) = buffer.find_crlf() else {
            // Request line not complete yet.
            return;
        };
        let line = buffer.read(line_end);
        buffer.retrieve_all();

        let line = String::from_utf8_lossy(&line);
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("GET"), Some(target)) => {
                info!("{} GET {}", conn.peer_addr(), target);
                self.respond(conn, target);
            }
            _ => {
                conn.send(b"HTTP/1.0 400 Bad Request\r\nConnection: close\r\n\r\n");
                conn.shutdown();
            }
        }
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let root = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());
    info!("serving {} on 0.0.0.0:8080", root);
    let listener = Listener::bind("0.0.0.0:8080".parse().unwrap())
        .name("file-server")
        .with(FileServer { root: root.into() });
    EventLoopGroup::new(4).serve(listener)
}
