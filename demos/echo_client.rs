//! Counterpart to `echo_server`: sends one message, prints the reply,
//! quits.

use netloop::{
    quit_all_event_loops, Dialer, EventLoopGroup, Handler, MessageBuffer, TcpConnectionPtr,
};

struct Hello;

impl Handler for Hello {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        if conn.connected() {
            conn.send(b"hello over netloop\n");
        }
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
        let reply = buffer.read_all();
        println!("{}", String::from_utf8_lossy(&reply).trim_end());
        conn.shutdown();
        quit_all_event_loops();
    }

    fn on_connection_error(&self) {
        eprintln!("connect failed; is echo_server running?");
        quit_all_event_loops();
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let dialer = Dialer::connect_to("127.0.0.1:7000".parse().unwrap())
        .name("echo-client")
        .with(Hello);
    EventLoopGroup::new(1).dial(dialer)
}
