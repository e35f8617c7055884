use super::config::{DialOptions, SecurityMode};
use super::connection::{CallTable, ClientCall, read_responses, write_frames};
use super::protocol::StreamProtocol;
use super::session::{Credit, Role, StreamSession, inbound_queue};
use super::tcp::TcpProtocol;
use super::tls;
use crate::proto::{Frame, FrameCodec, Status};
use crate::{CallShape, Direction, EchoError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{Instrument, debug, info};

/// One long-lived connection to an RPC server
///
/// Any number of calls can be open on the connection at once; each call
/// gets its own [`StreamSession`].
///
/// # Examples
///
/// ```no_run
/// use echorpc::transport::{Client, DialOptions};
/// use echorpc::{Message, Response};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Client::connect("127.0.0.1:8080", DialOptions::default()).await?;
///     let response: Response = client
///         .unary("echo/Echo", Message::from("hello"), Duration::from_secs(120))
///         .await?;
///     println!("index {} echoed {}", response.index, response.message);
///     Ok(())
/// }
/// ```
pub struct Client {
    outbound: mpsc::Sender<Frame>,
    calls: CallTable,
    next_call: AtomicU32,
    options: DialOptions,
    reader: JoinHandle<()>,
}

impl Client {
    /// Dials `addr` over TCP
    pub async fn connect(addr: &str, options: DialOptions) -> Result<Self> {
        Self::connect_with::<TcpProtocol>(addr, options).await
    }

    /// Dials `addr` with any stream protocol, wrapping it in TLS when asked
    pub async fn connect_with<P: StreamProtocol>(addr: &str, options: DialOptions) -> Result<Self> {
        let dial_failed = |source: std::io::Error| EchoError::Dial {
            addr: addr.to_string(),
            source,
        };
        let dial = async {
            let stream = P::connect(addr).await?;
            let client = match &options.security {
                SecurityMode::Plaintext => Self::from_io(stream, options.clone()),
                SecurityMode::Tls {
                    server_name_override,
                    skip_verify,
                } => {
                    let stream =
                        tls::handshake(stream, addr, server_name_override.as_deref(), *skip_verify)
                            .await?;
                    Self::from_io(stream, options.clone())
                }
            };
            Ok::<_, std::io::Error>(client)
        };

        let client = timeout(options.connect_timeout, dial)
            .await
            .map_err(|_| {
                dial_failed(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection timeout",
                ))
            })?
            .map_err(dial_failed)?;

        info!(
            %addr,
            tls = matches!(options.security, SecurityMode::Tls { .. }),
            authority = options.authority.as_deref(),
            "Connected to server"
        );
        Ok(client)
    }

    /// Runs the client side of the protocol over an already-connected stream
    pub fn from_io<T>(io: T, options: DialOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound, outbound_rx) = mpsc::channel(options.connection.outbound_buffer);
        let calls = CallTable::default();

        let max_frame_length = options.connection.max_frame_length;
        tokio::spawn(
            write_frames(
                FramedWrite::new(write_half, FrameCodec::new(max_frame_length)),
                outbound_rx,
            )
            .in_current_span(),
        );
        let reader = tokio::spawn(
            read_responses(
                FramedRead::new(read_half, FrameCodec::new(max_frame_length)),
                calls.clone(),
                outbound.clone(),
            )
            .in_current_span(),
        );

        Self {
            outbound,
            calls,
            next_call: AtomicU32::new(1),
            options,
            reader,
        }
    }

    /// Opens a call on `method` that must finish within `timeout`
    ///
    /// Opening does not wait for the server. A method the server does not
    /// know is reported by the first `receive()` on the session.
    pub async fn open<S, R>(&self, method: &str, timeout: Duration) -> Result<StreamSession<S, R>>
    where
        S: Serialize,
        R: DeserializeOwned,
    {
        // Odd ids, leaving even ids free should the server ever open calls
        let call = self.next_call.fetch_add(2, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;

        let window = self.options.connection.window();
        let (inbound_tx, inbound_rx) = inbound_queue(window);
        // No credit until the server has accepted the call
        let credit = Credit::new(0);
        let call_open_failed = |status: Status| EchoError::CallOpen {
            method: method.to_string(),
            status,
        };
        let entry = ClientCall {
            inbound: inbound_tx,
            credit: credit.clone(),
        };
        self.calls.register(call, entry).map_err(call_open_failed)?;

        let open = Frame::Open {
            call,
            method: method.to_string(),
            timeout_ms: Some(timeout.as_millis().try_into().unwrap_or(u64::MAX)),
            authority: self.options.authority.clone(),
            window,
        };
        if self.outbound.send(open).await.is_err() {
            self.calls.remove(call);
            return Err(call_open_failed(Status::unavailable("connection closed")));
        }

        debug!(call, method, ?timeout, "Opened call");
        Ok(StreamSession::new(
            call,
            Role::Client,
            self.outbound.clone(),
            inbound_rx,
            window,
            credit,
            Some(deadline),
        ))
    }

    /// Single request, single response
    pub async fn unary<Req, Resp>(&self, method: &str, request: Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let shape = CallShape::Unary;
        let mut session = self.open::<Req, Resp>(method, timeout).await?;
        send_request(&mut session, method, shape, request).await?;

        let response = match session.receive().await {
            Ok(Some(response)) => response,
            Ok(None) => {
                return Err(EchoError::transport(
                    shape,
                    Direction::Receive,
                    Status::internal("call finished without a response"),
                ));
            }
            Err(status) => return Err(EchoError::on_call(method, shape, Direction::Receive, status)),
        };

        match session.receive().await {
            Ok(None) => Ok(response),
            Ok(Some(_)) => Err(EchoError::transport(
                shape,
                Direction::Receive,
                Status::internal("unary call returned more than one response"),
            )),
            Err(status) => Err(EchoError::on_call(method, shape, Direction::Receive, status)),
        }
    }

    /// Single request, every response up to the server's end-of-stream
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        timeout: Duration,
    ) -> Result<Vec<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let shape = CallShape::ServerStreaming;
        let mut session = self.open::<Req, Resp>(method, timeout).await?;
        send_request(&mut session, method, shape, request).await?;

        let mut responses = Vec::new();
        loop {
            match session.receive().await {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => return Ok(responses),
                Err(status) => {
                    return Err(EchoError::on_call(method, shape, Direction::Receive, status));
                }
            }
        }
    }
}

async fn send_request<Req, Resp>(
    session: &mut StreamSession<Req, Resp>,
    method: &str,
    shape: CallShape,
    request: Req,
) -> Result<()>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    session
        .send(request)
        .await
        .map_err(|status| EchoError::on_call(method, shape, Direction::Send, status))?;
    session
        .close_send()
        .await
        .map_err(|status| EchoError::on_call(method, shape, Direction::Send, status))
}

impl Drop for Client {
    fn drop(&mut self) {
        // The writer drains on its own once the last session lets go of
        // the outbound queue; the reader would otherwise wait on the server
        // while holding its own handle on that queue.
        self.reader.abort();
    }
}
