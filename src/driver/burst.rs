//! Client side of the bidirectional echo exchange
//!
//! The send path and the receive path of one stream run on two separate
//! tasks. Sending everything before reading anything would stall as soon
//! as the burst no longer fits in the transport's buffers, because the
//! server stops reading while its replies go unread.

use super::client::EchoClient;
use super::config::BurstConfig;
use crate::common::{MessageSink, MessageSource};
use crate::proto::{Message, Method, Response, Status};
use crate::{CallShape, Direction, EchoError, Result};
use tokio::sync::oneshot;
use tracing::{Instrument, Span, debug, error, info};

const SHAPE: CallShape = CallShape::Bidirectional;

/// Drives one burst of messages through a bidirectional stream
///
/// # Examples
///
/// ```no_run
/// use echorpc::{BurstConfig, DialOptions, EchoClient, StreamDriver};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = EchoClient::connect("127.0.0.1:8080", DialOptions::default(), "echo").await?;
///     let responses = StreamDriver::new(BurstConfig::default()).run(&client).await?;
///     assert_eq!(responses.len(), 10);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct StreamDriver {
    config: BurstConfig,
    span: Span,
}

impl StreamDriver {
    pub fn new(config: BurstConfig) -> Self {
        Self {
            config,
            span: tracing::info_span!("burst"),
        }
    }

    /// Logs all driver activity under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Opens a stream on `client` and drives the configured burst through it
    ///
    /// Returns every response in arrival order once the server has ended
    /// the stream cleanly.
    pub async fn run(&self, client: &EchoClient) -> Result<Vec<Response>> {
        let method = client.method_path(Method::Stream);
        let session = client.open_stream(self.config.deadline).await?;
        let (sink, source) = session.split();
        self.drive(&method, sink, source).await
    }

    /// Drives the burst over an already opened stream
    ///
    /// The receive path runs on its own task and reports through a one-shot
    /// completion, whether it ends cleanly or not. Any failure on either
    /// path fails the whole exchange; nothing partial is returned.
    pub async fn drive<K, S>(&self, method: &str, mut sink: K, source: S) -> Result<Vec<Response>>
    where
        K: MessageSink<Message>,
        S: MessageSource<Response> + 'static,
    {
        let (done_tx, mut done_rx) = oneshot::channel();
        let receiver = tokio::spawn(
            drain(method.to_string(), source, done_tx).instrument(self.span.clone()),
        );

        let sent = tokio::select! {
            biased;
            early = &mut done_rx => {
                receiver.abort();
                return match early {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(responses)) => Err(EchoError::transport(
                        SHAPE,
                        Direction::Receive,
                        Status::internal(format!(
                            "server ended the stream after {} responses, before the burst was sent",
                            responses.len()
                        )),
                    )),
                    Err(_) => Err(receive_task_lost()),
                };
            }
            sent = self.send_burst(method, &mut sink).instrument(self.span.clone()) => sent,
        };

        if let Err(e) = sent {
            receiver.abort();
            return Err(e);
        }

        match done_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(receive_task_lost()),
        }
    }

    async fn send_burst<K>(&self, method: &str, sink: &mut K) -> Result<usize>
    where
        K: MessageSink<Message>,
    {
        for position in 0..self.config.count {
            let message = self.config.content.message_at(position);
            debug!(position, preview = %message.preview(), "[bidi-stream] sending");
            sink.send(message).await.map_err(|status| {
                error!(position, error = %status, "[bidi-stream] failed to send");
                EchoError::on_call(method, SHAPE, Direction::Send, status)
            })?;
        }
        sink.close_send()
            .await
            .map_err(|status| EchoError::on_call(method, SHAPE, Direction::Send, status))?;
        info!(sent = self.config.count, "[bidi-stream] finished sending");
        Ok(self.config.count)
    }
}

/// Receive loop: collects responses until end-of-stream or failure and
/// always reports the outcome on `done`
async fn drain<S>(method: String, mut source: S, done: oneshot::Sender<Result<Vec<Response>>>)
where
    S: MessageSource<Response>,
{
    let mut responses = Vec::new();
    let outcome = loop {
        match source.receive().await {
            Ok(Some(response)) => {
                info!(
                    index = response.index,
                    received_at = %response.received_at,
                    preview = %response.message.preview(),
                    "[bidi-stream] response"
                );
                responses.push(response);
            }
            Ok(None) => {
                info!(received = responses.len(), "[bidi-stream] server finished stream");
                break Ok(responses);
            }
            Err(status) => {
                error!(error = %status, "[bidi-stream] failed to receive a response");
                break Err(EchoError::on_call(&method, SHAPE, Direction::Receive, status));
            }
        }
    };
    // The driver may have given up already
    let _ = done.send(outcome);
}

fn receive_task_lost() -> EchoError {
    EchoError::transport(
        SHAPE,
        Direction::Receive,
        Status::internal("receive task ended without reporting"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Code;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::mpsc;

    /// In-memory echo peer: every sent message comes back as a response on
    /// the paired source, and close_send ends the stream
    struct LoopbackSink {
        tx: Option<mpsc::Sender<std::result::Result<Response, Status>>>,
        sent: i32,
        fail_at: Option<i32>,
    }

    struct LoopbackSource {
        rx: mpsc::Receiver<std::result::Result<Response, Status>>,
    }

    fn loopback(capacity: usize, fail_at: Option<i32>) -> (LoopbackSink, LoopbackSource) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            LoopbackSink {
                tx: Some(tx),
                sent: 0,
                fail_at,
            },
            LoopbackSource { rx },
        )
    }

    #[async_trait]
    impl MessageSink<Message> for LoopbackSink {
        async fn send(&mut self, item: Message) -> std::result::Result<(), Status> {
            if self.fail_at == Some(self.sent) {
                return Err(Status::unavailable("connection reset"));
            }
            self.sent += 1;
            let response = Response {
                index: self.sent,
                received_at: Utc::now(),
                message: item,
            };
            let tx = self.tx.as_ref().ok_or_else(|| Status::internal("closed"))?;
            tx.send(Ok(response))
                .await
                .map_err(|_| Status::unavailable("peer gone"))
        }

        async fn close_send(&mut self) -> std::result::Result<(), Status> {
            self.tx = None;
            Ok(())
        }
    }

    #[async_trait]
    impl MessageSource<Response> for LoopbackSource {
        async fn receive(&mut self) -> std::result::Result<Option<Response>, Status> {
            match self.rx.recv().await {
                Some(Ok(response)) => Ok(Some(response)),
                Some(Err(status)) => Err(status),
                None => Ok(None),
            }
        }
    }

    #[tokio::test]
    async fn test_burst_larger_than_buffer_completes() {
        // One-slot buffer: only progresses if the receive path drains concurrently
        let (sink, source) = loopback(1, None);
        let driver = StreamDriver::new(BurstConfig::default().with_count(50));

        let responses = driver.drive("echo/Stream", sink, source).await.unwrap();

        assert_eq!(responses.len(), 50);
        assert!(responses.iter().enumerate().all(|(i, r)| r.index == i as i32 + 1));
    }

    #[tokio::test]
    async fn test_empty_burst_yields_no_responses() {
        let (sink, source) = loopback(1, None);
        let driver = StreamDriver::new(BurstConfig::default().with_count(0));

        let responses = driver.drive("echo/Stream", sink, source).await.unwrap();
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_aborts_without_hanging() {
        let (sink, source) = loopback(4, Some(3));
        let driver = StreamDriver::new(BurstConfig::default().with_count(10));

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            driver.drive("echo/Stream", sink, source),
        )
        .await
        .expect("driver hung after a send failure")
        .unwrap_err();

        assert!(matches!(
            err,
            EchoError::Transport {
                direction: Direction::Send,
                ..
            }
        ));
    }

    /// Sink that never completes a send, as under permanent backpressure
    struct StuckSink;

    #[async_trait]
    impl MessageSink<Message> for StuckSink {
        async fn send(&mut self, _item: Message) -> std::result::Result<(), Status> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_receive_failure_releases_blocked_sender() {
        let (tx, rx) = mpsc::channel(1);
        tx.send(Err(Status::deadline_exceeded("call deadline elapsed")))
            .await
            .unwrap();
        let driver = StreamDriver::new(BurstConfig::default());

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            driver.drive("echo/Stream", StuckSink, LoopbackSource { rx }),
        )
        .await
        .expect("driver hung after a receive failure")
        .unwrap_err();

        assert!(err.is_deadline_exceeded());
        assert!(matches!(
            err,
            EchoError::Transport {
                direction: Direction::Receive,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stream_ending_early_is_an_error() {
        let (tx, rx) = mpsc::channel::<std::result::Result<Response, Status>>(1);
        drop(tx);
        let driver = StreamDriver::new(BurstConfig::default());

        let err = driver
            .drive("echo/Stream", StuckSink, LoopbackSource { rx })
            .await
            .unwrap_err();
        assert_eq!(err.status().map(|s| s.code), Some(Code::Internal));
    }

    #[tokio::test]
    async fn test_unknown_method_surfaces_as_call_open() {
        let (tx, rx) = mpsc::channel(1);
        tx.send(Err(Status::unimplemented("unknown method echo/Nope")))
            .await
            .unwrap();
        let driver = StreamDriver::new(BurstConfig::default());

        let err = driver
            .drive("echo/Nope", StuckSink, LoopbackSource { rx })
            .await
            .unwrap_err();
        assert!(matches!(err, EchoError::CallOpen { ref method, .. } if method == "echo/Nope"));
    }

    #[tokio::test]
    async fn test_injected_span_wraps_both_directions() {
        let (logs, _guard) = crate::common::capture_logs();
        let (sink, source) = loopback(4, None);
        let driver = StreamDriver::new(BurstConfig::default().with_count(3))
            .with_span(tracing::info_span!("burst-to-staging"));

        driver.drive("echo/Stream", sink, source).await.unwrap();

        let output = logs.contents();
        let lines_in_span = |needle: &str| {
            output
                .lines()
                .any(|line| line.contains("burst-to-staging") && line.contains(needle))
        };
        assert!(lines_in_span("[bidi-stream] finished sending"), "{output}");
        assert!(lines_in_span("[bidi-stream] server finished stream"), "{output}");
    }
}
