use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Trait for stream-based transports the RPC layer can run over
///
/// This trait defines how a server obtains connections and how a client
/// dials one. Everything above the byte stream (framing, calls, sessions)
/// is shared by every implementation.
pub trait StreamProtocol {
    /// Listener type for this protocol
    type Listener: Send;
    /// Connected stream type for this protocol
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Binds a listener to the given address (server-side)
    fn bind(addr: SocketAddr) -> impl Future<Output = io::Result<Self::Listener>> + Send;

    /// Address the listener actually bound to
    fn local_addr(listener: &Self::Listener) -> io::Result<SocketAddr>;

    /// Accepts a new connection from the listener (server-side)
    fn accept(
        listener: &mut Self::Listener,
    ) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    /// Connects to a server at the given address (client-side)
    fn connect(addr: &str) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}
