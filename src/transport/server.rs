use super::config::{ConnectionConfig, ServerConfig};
use super::connection::write_frames;
use super::protocol::StreamProtocol;
use super::session::{
    Credit, Delivery, Inbound, Role, StreamSession, connection_lost, deliver, inbound_queue,
};
use super::tcp::TcpProtocol;
use crate::common::EchoServerTrait;
use crate::handler::EchoService;
use crate::proto::{CallId, Frame, FrameCodec, Method, Status};
use crate::{EchoError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{Instrument, debug, error, info, warn};

/// A call accepted by the server, not yet bound to message types
///
/// The service decides what the call carries once it knows which method
/// was requested.
pub struct ServerCall {
    call: CallId,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Inbound>,
    window: u32,
    credit: Arc<Credit>,
    deadline: Option<Instant>,
}

impl ServerCall {
    pub fn call_id(&self) -> CallId {
        self.call
    }

    /// Binds the call to the types it sends and receives
    pub fn into_session<S, R>(self) -> StreamSession<S, R>
    where
        S: Serialize,
        R: DeserializeOwned,
    {
        StreamSession::new(
            self.call,
            Role::Server,
            self.outbound,
            self.inbound,
            self.window,
            self.credit,
            self.deadline,
        )
    }
}

/// Routing entry for one call on a server connection
struct OpenCall {
    /// Gone once the client half-closed or the call stopped reading
    inbound: Option<mpsc::Sender<Inbound>>,
    /// Credit the client grants for this call's responses
    credit: Arc<Credit>,
}

impl OpenCall {
    fn deliver(&mut self, inbound: Inbound) {
        let Some(queue) = &self.inbound else {
            return;
        };
        if deliver(queue, inbound) != Delivery::Queued {
            self.inbound = None;
        }
    }
}

/// Serves RPC calls on one established connection until the peer leaves
///
/// Every call runs on its own task; the frames of one call reach its task
/// in the order they arrived. The reader never waits on a call, so a call
/// that stops reading cannot hold up the others.
pub async fn serve_connection<T>(
    io: T,
    peer: SocketAddr,
    service: Arc<EchoService>,
    config: ConnectionConfig,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let (outbound, outbound_rx) = mpsc::channel(config.outbound_buffer);
    let writer = tokio::spawn(
        write_frames(
            FramedWrite::new(write_half, FrameCodec::new(config.max_frame_length)),
            outbound_rx,
        )
        .in_current_span(),
    );

    let mut frames = FramedRead::new(read_half, FrameCodec::new(config.max_frame_length));
    let mut calls: HashMap<CallId, OpenCall> = HashMap::new();
    // Client call ids only grow, so anything at or below this was used already
    let mut last_call: Option<CallId> = None;
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<CallId>();
    let window = config.window();

    let outcome = loop {
        let frame = tokio::select! {
            Some(call) = finished_rx.recv() => {
                calls.remove(&call);
                continue;
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(EchoError::from(e)),
                None => {
                    info!(%peer, "Client closed connection");
                    break Ok(());
                }
            },
        };

        match frame {
            Frame::Open {
                call,
                method,
                timeout_ms,
                authority,
                window: client_window,
            } => {
                if last_call.is_some_and(|last| call <= last) {
                    warn!(%peer, call, "Rejecting reused call id");
                    let status = Status::invalid_argument("call id already used");
                    let _ = outbound.send(Frame::Close { call, status }).await;
                    continue;
                }
                last_call = Some(call);

                let Some(route) = service.route(&method) else {
                    warn!(%peer, call, %method, "Rejecting call to unknown method");
                    let status = Status::unimplemented(format!("unknown method {method}"));
                    let _ = outbound.send(Frame::Close { call, status }).await;
                    continue;
                };

                let (inbound_tx, inbound_rx) = inbound_queue(window);
                let credit = Credit::new(client_window);
                calls.insert(
                    call,
                    OpenCall {
                        inbound: Some(inbound_tx),
                        credit: credit.clone(),
                    },
                );
                let _ = outbound
                    .send(Frame::Credit {
                        call,
                        count: window,
                    })
                    .await;

                let server_call = ServerCall {
                    call,
                    outbound: outbound.clone(),
                    inbound: inbound_rx,
                    window,
                    credit,
                    deadline: timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
                };
                let span = tracing::info_span!("call", call, %method, authority = authority.as_deref());
                tokio::spawn(
                    run_call(
                        service.clone(),
                        route,
                        server_call,
                        outbound.clone(),
                        finished_tx.clone(),
                    )
                    .instrument(span),
                );
            }
            Frame::Message { call, payload } => {
                let Some(entry) = calls.get_mut(&call) else {
                    debug!(%peer, call, "Dropping message for finished call");
                    continue;
                };
                entry.deliver(Inbound::Message(payload));
            }
            Frame::Credit { call, count } => {
                let Some(entry) = calls.get_mut(&call) else {
                    continue;
                };
                if let Err(status) = entry.credit.grant(count) {
                    warn!(%peer, call, error = %status, "Failing call on bad credit");
                    entry.credit.close(status.clone());
                    entry.deliver(Inbound::Failed(status));
                }
            }
            Frame::HalfClose { call } => {
                if let Some(entry) = calls.get_mut(&call) {
                    entry.deliver(Inbound::End);
                    entry.inbound = None;
                }
            }
            Frame::Cancel { call } => {
                if let Some(mut entry) = calls.remove(&call) {
                    debug!(%peer, call, "Client cancelled call");
                    let status = Status::cancelled("cancelled by client");
                    entry.credit.close(status.clone());
                    entry.deliver(Inbound::Failed(status));
                }
            }
            Frame::Close { call, .. } => {
                warn!(%peer, call, "Ignoring trailer sent by client");
            }
        }
    };

    // Calls still open see the connection as lost once their queues go
    for entry in calls.into_values() {
        entry.credit.close(connection_lost());
    }
    drop(outbound);
    if let Err(e) = writer.await {
        error!(%peer, error = %e, "Connection writer panicked");
    }
    outcome
}

async fn run_call(
    service: Arc<EchoService>,
    method: Method,
    call: ServerCall,
    outbound: mpsc::Sender<Frame>,
    finished: mpsc::UnboundedSender<CallId>,
) {
    let id = call.call_id();
    let status = match service.call(method, call).await {
        Ok(()) => Status::ok(),
        Err(e) => {
            warn!(error = %e, "Call failed");
            e.to_status()
        }
    };
    debug!(code = %status.code, "Call finished");
    // The client may already be gone; there is nobody left to tell
    let _ = outbound.send(Frame::Close { call: id, status }).await;
    let _ = finished.send(id);
}

/// RPC server that accepts connections from any stream protocol
///
/// # Examples
///
/// ```no_run
/// use echorpc::{EchoServerTrait, ServerConfig, TcpRpcServer};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig::new("0.0.0.0:8080".parse()?).with_service("ping");
///     let server = TcpRpcServer::new(config);
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct RpcServer<P: StreamProtocol> {
    config: ServerConfig,
    service: Arc<EchoService>,
    protocol: PhantomData<fn() -> P>,
    shutdown_signal: Arc<broadcast::Sender<()>>,
}

/// RPC server listening on TCP
pub type TcpRpcServer = RpcServer<TcpProtocol>;

impl<P: StreamProtocol> RpcServer<P> {
    /// Creates a server exposing the echo service named in `config`
    pub fn new(config: ServerConfig) -> Self {
        let service = EchoService::new(config.service.clone());
        let (shutdown_signal, _) = broadcast::channel(1);
        Self {
            config,
            service: Arc::new(service),
            protocol: PhantomData,
            shutdown_signal: Arc::new(shutdown_signal),
        }
    }

    /// Replaces the service the server exposes
    pub fn with_service(mut self, service: EchoService) -> Self {
        self.service = Arc::new(service);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<P::Listener> {
        P::bind(self.config.bind_addr)
            .await
            .map_err(|source| EchoError::Bind {
                addr: self.config.bind_addr.to_string(),
                source,
            })
    }

    /// Accepts connections on `listener` until shut down
    pub async fn serve(&self, mut listener: P::Listener) -> Result<()> {
        let address = P::local_addr(&listener)?;
        info!(%address, service = %self.service.name(), "RPC server listening");

        let connection_count = Arc::new(AtomicUsize::new(0));
        let mut shutdown_rx = self.shutdown_signal.subscribe();

        loop {
            tokio::select! {
                accept_result = P::accept(&mut listener) => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let current_count = connection_count.load(Ordering::SeqCst);
                            if current_count >= self.config.max_connections {
                                warn!(%addr, current = current_count, limit = self.config.max_connections, "Connection rejected: limit reached");
                                continue;
                            }

                            let new_count = connection_count.fetch_add(1, Ordering::SeqCst) + 1;
                            info!(%addr, current = new_count, "Accepted connection");

                            let service = self.service.clone();
                            let connection = self.config.connection.clone();
                            let connection_count = connection_count.clone();
                            let span = tracing::info_span!("connection", %addr);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, service, connection).await {
                                    error!(%addr, error = %e, "Error handling connection");
                                }
                                let final_count = connection_count.fetch_sub(1, Ordering::SeqCst) - 1;
                                info!(%addr, current = final_count, "Connection closed");
                            }.instrument(span));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received internal shutdown signal, stopping server");
                    break;
                }
            }
        }

        info!("RPC server stopped");
        Ok(())
    }
}

#[async_trait]
impl<P> EchoServerTrait for RpcServer<P>
where
    P: StreamProtocol + Send + Sync,
{
    /// Binds the configured address and serves until shut down
    async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Returns a shutdown signal sender that can be used to gracefully shutdown the server
    fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_signal.as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_new() {
        let server = TcpRpcServer::new(ServerConfig::default().with_service("ping"));
        assert_eq!(server.config().service, "ping");
        assert_eq!(server.shutdown_signal().receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_error_names_address() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let server = TcpRpcServer::new(ServerConfig::new(addr));
        let err = server.bind().await.unwrap_err();
        assert!(matches!(err, EchoError::Bind { .. }));
        assert!(err.to_string().contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_serve() {
        let server = TcpRpcServer::new(ServerConfig::default());
        let listener = server.bind().await.unwrap();
        let shutdown = server.shutdown_signal();

        let handle = tokio::spawn(async move { server.serve(listener).await });
        while shutdown.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.send(()).unwrap();

        handle.await.unwrap().unwrap();
    }

    type RawWriter = FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, FrameCodec>;
    type RawReader = FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, FrameCodec>;

    /// Speaks raw frames to `serve_connection` over an in-memory pipe
    fn raw_connection() -> (RawWriter, RawReader) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let peer = SocketAddr::from(([127, 0, 0, 1], 0));
        tokio::spawn(serve_connection(
            server_io,
            peer,
            Arc::new(EchoService::new("echo")),
            ConnectionConfig::default(),
        ));
        let (read_half, write_half) = tokio::io::split(client_io);
        (
            FramedWrite::new(write_half, FrameCodec::default()),
            FramedRead::new(read_half, FrameCodec::default()),
        )
    }

    fn open(call: CallId, method: &str, window: u32) -> Frame {
        Frame::Open {
            call,
            method: method.to_string(),
            timeout_ms: None,
            authority: None,
            window,
        }
    }

    fn text(call: CallId, body: &str) -> Frame {
        Frame::Message {
            call,
            payload: serde_json::to_value(crate::proto::Message::from(body)).unwrap(),
        }
    }

    /// Reads frames until one matches, failing after a few seconds
    async fn read_until(reader: &mut RawReader, wanted: impl Fn(&Frame) -> bool) -> Vec<Frame> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(frame) = reader.next().await {
                let frame = frame.unwrap();
                let done = wanted(&frame);
                seen.push(frame);
                if done {
                    return;
                }
            }
            panic!("connection closed early: {seen:?}");
        })
        .await
        .expect("expected frame never arrived");
        seen
    }

    #[tokio::test]
    async fn test_stalled_call_does_not_block_other_calls() {
        use futures::SinkExt;
        let (mut writer, mut reader) = raw_connection();

        // Call 1 grants a single response and never tops it up
        writer.send(open(1, "echo/Stream", 1)).await.unwrap();
        for i in 0..20 {
            writer.send(text(1, &format!("stuck-{i}"))).await.unwrap();
        }

        writer.send(open(3, "echo/Echo", 8)).await.unwrap();
        writer.send(text(3, "b")).await.unwrap();
        writer.send(Frame::HalfClose { call: 3 }).await.unwrap();

        let seen = read_until(&mut reader, |frame| {
            matches!(frame, Frame::Close { call: 3, .. })
        })
        .await;

        assert!(seen.iter().any(|f| matches!(f, Frame::Message { call: 3, .. })));
        assert!(seen.contains(&Frame::Close {
            call: 3,
            status: Status::ok()
        }));
        let stuck_responses = seen
            .iter()
            .filter(|f| matches!(f, Frame::Message { call: 1, .. }))
            .count();
        // Its single granted response may or may not have gone out yet
        assert!(stuck_responses <= 1);
    }

    #[tokio::test]
    async fn test_reused_call_id_is_rejected_after_half_close() {
        use futures::SinkExt;
        let (mut writer, mut reader) = raw_connection();

        writer.send(open(1, "echo/Stream", 8)).await.unwrap();
        writer.send(Frame::HalfClose { call: 1 }).await.unwrap();
        writer.send(open(1, "echo/Stream", 8)).await.unwrap();

        let seen = read_until(&mut reader, |frame| {
            matches!(
                frame,
                Frame::Close { call: 1, status } if status.code == crate::proto::Code::InvalidArgument
            )
        })
        .await;
        assert!(seen.contains(&Frame::Credit { call: 1, count: 32 }));
    }

    #[tokio::test]
    async fn test_lower_call_id_is_rejected() {
        use futures::SinkExt;
        let (mut writer, mut reader) = raw_connection();

        writer.send(open(5, "echo/Stream", 8)).await.unwrap();
        writer.send(open(3, "echo/Echo", 8)).await.unwrap();

        read_until(&mut reader, |frame| {
            matches!(
                frame,
                Frame::Close { call: 3, status } if status.code == crate::proto::Code::InvalidArgument
            )
        })
        .await;
    }
}
