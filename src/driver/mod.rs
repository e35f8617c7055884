//! Client-side call drivers
//!
//! [`EchoClient`] wraps a connection with typed echo calls, and
//! [`StreamDriver`] runs a concurrent send/receive burst over a
//! bidirectional stream.

pub mod burst;
pub mod client;
pub mod config;

pub use burst::StreamDriver;
pub use client::EchoClient;
pub use config::{BurstConfig, BurstContent};
