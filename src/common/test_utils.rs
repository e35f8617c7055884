use crate::common::EchoServerTrait;
use crate::handler::EchoService;
use crate::transport::{Client, ConnectionConfig, DialOptions, ServerConfig, TcpRpcServer, serve_connection};
use crate::Result;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::subscriber::DefaultGuard;

/// Starts a TCP server for `service` on an ephemeral loopback port
///
/// Returns the server task, the address it listens on and the sender that
/// shuts it down. The listener is bound before this returns, so clients
/// can connect right away.
pub async fn spawn_test_server(
    service: &str,
) -> Result<(JoinHandle<Result<()>>, SocketAddr, broadcast::Sender<()>)> {
    let config = ServerConfig::default().with_service(service);
    let server = TcpRpcServer::new(config);
    let listener = server.bind().await?;
    let addr = listener.local_addr()?;
    let shutdown = server.shutdown_signal();

    let server_handle = tokio::spawn(async move { server.serve(listener).await });

    Ok((server_handle, addr, shutdown))
}

/// Connects a client to a server for `service` through an in-memory pipe
///
/// `pipe_capacity` bounds the bytes in flight per direction, which makes
/// it easy to put the transport under backpressure.
pub fn in_memory_client(service: &str, pipe_capacity: usize, connection: ConnectionConfig) -> Client {
    let (client_io, server_io) = tokio::io::duplex(pipe_capacity);
    let service = Arc::new(EchoService::new(service));
    let peer = SocketAddr::from(([127, 0, 0, 1], 0));

    tokio::spawn(serve_connection(server_io, peer, service, connection.clone()));

    Client::from_io(client_io, DialOptions::default().with_connection(connection))
}

/// Log output collected in memory by [`capture_logs`]
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Everything logged so far, formatted without colors
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sends this thread's logs to memory until the returned guard drops
///
/// Spans must be created after this call, or they stay disabled.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}
