//! Common traits and helpers used across the echorpc library
//!
//! This module contains the traits that define the two directions of a
//! call and the interface of a server, plus helpers for standing up a
//! server in tests.

pub mod test_utils;
pub mod traits;

pub use test_utils::{CapturedLogs, capture_logs, in_memory_client, spawn_test_server};
pub use traits::{EchoServerTrait, MessageSink, MessageSource};
