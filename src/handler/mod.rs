//! Server-side call handling
//!
//! [`EchoHandler`] holds the echo logic for each call shape and
//! [`EchoService`] routes method paths to it.

pub mod echo;
pub mod service;

pub use echo::{EchoHandler, EchoSession};
pub use service::EchoService;
