//! Callback-driven non-blocking TCP networking.
//!
//! netloop is a reactor: each [`EventLoop`] is pinned to one OS thread and
//! drives a readiness poller (epoll, kqueue or `poll(2)` depending on the
//! target); ready fds dispatch to per-fd callback channels; timers come
//! from a deadline queue plus a coarse timing wheel used to kick idle
//! connections; [`TcpConnection`] layers a buffered, full-duplex state
//! machine on top, with a write pipeline that mixes byte buffers, files
//! (`sendfile(2)` on Linux) and lazy producer streams.
//!
//! No wire protocol is imposed: [`Handler::on_message`] hands the raw
//! receive buffer to the application, which consumes whatever is complete
//! and leaves the rest.
//!
//! # Example: an echo server
//!
//! ```no_run
//! use netloop::{EventLoopGroup, Handler, Listener, MessageBuffer, TcpConnectionPtr};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut MessageBuffer) {
//!         let data = buffer.read_all();
//!         conn.send(&data);
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let listener = Listener::bind("0.0.0.0:7000".parse().unwrap()).with(Echo);
//!     EventLoopGroup::new(4).serve(listener)
//! }
//! ```
//!
//! # Threading model
//!
//! Everything an event loop owns — channels, timers, connections' I/O
//! state — is touched only on its thread. Cross-thread entry points are
//! [`LoopHandle`] (`run_in_loop`, timers, `quit`) and the thread-safe
//! parts of the [`TcpConnection`] facade (`send`, `shutdown`,
//! `force_close`). Callbacks for one connection are serialized on its loop
//! and arrive in socket order.

#[macro_use]
mod macros;

mod acceptor;
mod addr;
mod buffer;
mod channel;
mod client;
mod connection;
mod connector;
mod event_loop;
mod interest;
mod loop_thread;
mod poller;
mod ready;
mod resolver;
mod server;
mod service;
mod socket;
mod sys;
mod timer;
mod token;
mod wheel;

pub use addr::InetAddr;
pub use buffer::MessageBuffer;
pub use channel::ChannelRef;
pub use client::TcpClient;
pub use connection::{ConnState, TcpConnection, TcpConnectionPtr};
pub use event_loop::{EventLoop, LoopHandle};
pub use interest::Interest;
pub use loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use ready::Ready;
pub use resolver::Resolver;
pub use server::TcpServer;
pub use service::{quit_all_event_loops, Dialer, EventLoopGroup, Handler, Listener};
pub use socket::Socket;
pub use timer::{TimerId, TimerPriority};
pub use token::Token;
pub use wheel::{TimingWheel, WheelEntry};
