//! A broadcast chat room over length-prefixed frames.
//!
//! Wire format: an 8-byte big-endian length, then that many bytes of
//! message. Every complete frame is fanned out to every other connected
//! peer, re-framed the same way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use netloop::{EventLoopGroup, Handler, Listener, MessageBuffer, TcpConnectionPtr};

const HEADER_LEN: usize = 8;
const MAX_FRAME: u64 = 64 * 1024;

#[derive(Default)]
struct ChatRoom {
    peers: Mutex<HashMap<usize, TcpConnectionPtr>>,
}

impl ChatRoom {
    fn key(conn: &TcpConnectionPtr) -> usize {
        Arc::as_ptr(conn) as usize
    }

    fn broadcast(&self, from: &TcpConnectionPtr, body: &[u8]) {
        let mut frame = MessageBuffer::with_capacity(HEADER_LEN + body.len());
        frame.push_back(body);
        frame.push_front_u64(body.len() as u64);

        let peers = self.peers.lock().unwrap();
        for (key, peer) in peers.iter() {
            if *key != Self::key(from) {
                peer.send(frame.peek());
            }
        }
    }
}

impl Handler for ChatRoom {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        let mut peers = self.peers.lock().unwrap();
        if conn.connected() {
            info!("{} joined ({} in the room)", conn.peer_addr(), peers.len() + 1);
            peers.insert(Self::key(conn), Arc::clone(conn));
        } else {
            peers.remove(&Self::key(conn));
            info!("{} left ({} in the room)", conn.peer_addr(), peers.len());
        }
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
        while buffer.readable_bytes() >= HEADER_LEN {
            let len = buffer.peek_u64();
            if len > MAX_FRAME {
                info!("{} sent an oversized frame, dropping it", conn.peer_addr());
                conn.force_close();
                return;
            }
            if buffer.readable_bytes() < HEADER_LEN + len as usize {
                // Wait for the rest of the frame.
                break;
            }
            let _ = buffer.read_u64();
            let body = buffer.read(len as usize);
            self.broadcast(conn, &body);
        }
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let listener = Listener::bind("0.0.0.0:7001".parse().unwrap())
        .name("chat")
        .with(ChatRoom::default())
        .enable_kickoff_idle(Duration::from_secs(300));
    EventLoopGroup::new(2).serve(listener)
}
