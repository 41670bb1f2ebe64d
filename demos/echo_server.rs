//! A plain echo server: whatever arrives goes straight back.
//!
//! Run with `cargo run --example echo_server`, then talk to it:
//!
//! ```text
//! $ nc 127.0.0.1 7000
//! ```
//!
//! Connections silent for a minute are kicked.

use std::time::Duration;

use log::info;
use netloop::{EventLoopGroup, Handler, Listener, MessageBuffer, TcpConnectionPtr};

struct Echo;

impl Handler for Echo {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        info!(
            "{} is {}",
            conn.peer_addr(),
            if conn.connected() { "up" } else { "down" }
        );
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
        let data = buffer.read_all();
        conn.send(&data);
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let listener = Listener::bind("0.0.0.0:7000".parse().unwrap())
        .name("echo")
        .with(Echo)
        .enable_kickoff_idle(Duration::from_secs(60));
    EventLoopGroup::new(4).serve(listener)
}
