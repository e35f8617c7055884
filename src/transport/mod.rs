//! Transport channel: framing, connections, calls and sessions
//!
//! Many calls share one long-lived connection. Each frame names its call,
//! a reader task per connection routes frames to the call they belong to,
//! and a writer task serializes everything the calls send. Dialed
//! connections can be wrapped in TLS.

pub mod client;
pub mod config;
mod connection;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tcp;
mod tls;

pub use client::Client;
pub use config::{ConnectionConfig, DialOptions, SecurityMode, ServerConfig};
pub use protocol::StreamProtocol;
pub use server::{RpcServer, ServerCall, TcpRpcServer, serve_connection};
pub use session::{RecvHalf, SendHalf, StreamSession};
pub use tcp::TcpProtocol;
