use crate::Result;
use crate::proto::Status;
use async_trait::async_trait;

/// Common trait for RPC servers
///
/// This trait defines the common interface that servers must implement,
/// whatever listener they accept connections from.
#[async_trait]
pub trait EchoServerTrait {
    /// Starts the server and serves connections until shut down
    async fn run(&self) -> Result<()>;

    /// Returns a shutdown signal sender that can be used to gracefully shutdown the server
    fn shutdown_signal(&self) -> tokio::sync::broadcast::Sender<()>;
}

/// Send direction of an open call
///
/// Implementations are driven by a single writer; sends on one sink are
/// issued one after another, never concurrently.
#[async_trait]
pub trait MessageSink<T: Send + 'static>: Send {
    /// Transmits one unit, suspending under backpressure
    async fn send(&mut self, item: T) -> std::result::Result<(), Status>;

    /// Tells the peer no further units follow
    ///
    /// Idempotent. Sinks whose direction is closed by other means (a server
    /// ends its direction by finishing the call) keep the default no-op.
    async fn close_send(&mut self) -> std::result::Result<(), Status> {
        Ok(())
    }
}

/// Receive direction of an open call
#[async_trait]
pub trait MessageSource<T: Send + 'static>: Send {
    /// Waits for the next unit
    ///
    /// `Ok(None)` is the end-of-stream signal: the peer finished cleanly,
    /// and every later call returns `Ok(None)` as well. Failures, including
    /// an elapsed deadline, come back as `Err` and are never reported as
    /// end-of-stream.
    async fn receive(&mut self) -> std::result::Result<Option<T>, Status>;
}
