use super::protocol::StreamProtocol;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// TCP protocol implementation
pub struct TcpProtocol;

impl StreamProtocol for TcpProtocol {
    type Listener = TcpListener;
    type Stream = TcpStream;

    async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    fn local_addr(listener: &TcpListener) -> io::Result<SocketAddr> {
        listener.local_addr()
    }

    async fn accept(listener: &mut TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = listener.accept().await?;
        // Small frames go out as soon as they are written
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    async fn connect(addr: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let mut listener = TcpProtocol::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = TcpProtocol::local_addr(&listener).unwrap();

        let client = tokio::spawn(async move { TcpProtocol::connect(&addr.to_string()).await });
        let (_stream, peer) = TcpProtocol::accept(&mut listener).await.unwrap();

        assert!(peer.ip().is_loopback());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(TcpProtocol::connect(&addr.to_string()).await.is_err());
    }
}
