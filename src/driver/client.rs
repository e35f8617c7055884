use crate::proto::{Message, Method, RepeatRequest, Response};
use crate::transport::{Client, DialOptions, StreamSession};
use crate::Result;
use std::time::Duration;

/// Deadline applied to unary and repeat calls
const UNARY_TIMEOUT: Duration = Duration::from_secs(120);

/// Typed client for the echo service
///
/// # Examples
///
/// ```no_run
/// use echorpc::{Content, DialOptions, EchoClient, Message};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = EchoClient::connect("127.0.0.1:8080", DialOptions::default(), "echo").await?;
///
///     let sent = Message::from(Content::new("Hi there", "Sample Client"));
///     let response = client.echo(sent.clone()).await?;
///     assert_eq!(response.message, sent);
///     assert_eq!(response.index, 1);
///     Ok(())
/// }
/// ```
pub struct EchoClient {
    client: Client,
    service: String,
}

impl EchoClient {
    pub fn new(client: Client, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }

    pub async fn connect(addr: &str, options: DialOptions, service: impl Into<String>) -> Result<Self> {
        let client = Client::connect(addr, options).await?;
        Ok(Self::new(client, service))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Full path of `method` on this client's service
    pub fn method_path(&self, method: Method) -> String {
        method.path(&self.service)
    }

    /// Unary echo of one message
    pub async fn echo(&self, message: Message) -> Result<Response> {
        let path = self.method_path(Method::Echo);
        self.client.unary(&path, message, UNARY_TIMEOUT).await
    }

    /// Asks the server to echo `message` back `count` times on one stream
    pub async fn repeat(&self, message: Message, count: u32) -> Result<Vec<Response>> {
        let path = self.method_path(Method::Repeat);
        let request = RepeatRequest { message, count };
        self.client
            .server_streaming(&path, request, UNARY_TIMEOUT)
            .await
    }

    /// Opens a bidirectional echo stream that must finish within `deadline`
    pub async fn open_stream(&self, deadline: Duration) -> Result<StreamSession<Message, Response>> {
        let path = self.method_path(Method::Stream);
        self.client.open(&path, deadline).await
    }
}
