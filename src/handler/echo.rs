use crate::common::{MessageSink, MessageSource};
use crate::proto::{Message, RepeatRequest, Response, Status};
use crate::{CallShape, Direction, EchoError, Result};
use chrono::Utc;
use tracing::{Instrument, Span, info};

/// Per-call sequencing state of a stream
///
/// The counter starts at zero, so the first stamped response carries
/// index 1. Indices advance by exactly one per stamped message.
#[derive(Debug, Default)]
pub struct EchoSession {
    counter: i32,
}

impl EchoSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stamped so far
    pub fn count(&self) -> i32 {
        self.counter
    }

    /// Builds the response correlated to `message`, capturing the time now
    pub fn stamp(&mut self, message: Message) -> std::result::Result<Response, Status> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| Status::internal("response index space exhausted"))?;
        Ok(Response {
            index: self.counter,
            received_at: Utc::now(),
            message,
        })
    }
}

/// Server-side echo logic for every call shape
///
/// Handlers never retry: a failed receive or send ends the call with an
/// error naming the failing direction, and any retry is up to whoever
/// issued the call.
///
/// # Examples
///
/// ```
/// use echorpc::{EchoHandler, Message};
///
/// let handler = EchoHandler::new();
/// let response = handler.unary(Message::from("Hi there"));
/// assert_eq!(response.index, 1);
/// assert_eq!(response.message, Message::from("Hi there"));
/// ```
#[derive(Debug, Clone)]
pub struct EchoHandler {
    span: Span,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self {
            span: tracing::info_span!("echo"),
        }
    }

    /// Logs all handler activity under `span`
    pub fn with_span(span: Span) -> Self {
        Self { span }
    }

    /// Echoes a single message; unary calls have no sequence so the index is 1
    pub fn unary(&self, message: Message) -> Response {
        let received_at = Utc::now();
        self.span.in_scope(|| info!(preview = %message.preview(), "[unary] echoing message"));
        Response {
            index: 1,
            received_at,
            message,
        }
    }

    /// Emits `request.count` responses for one request, indexed from 1
    pub async fn repeat<K>(&self, request: RepeatRequest, sink: &mut K) -> Result<i32>
    where
        K: MessageSink<Response>,
    {
        async {
            let mut session = EchoSession::new();
            for _ in 0..request.count {
                let response = session
                    .stamp(request.message.clone())
                    .map_err(|status| EchoError::transport(CallShape::ServerStreaming, Direction::Send, status))?;
                sink.send(response).await.map_err(|status| {
                    EchoError::transport(CallShape::ServerStreaming, Direction::Send, status)
                })?;
            }
            info!(sent = session.count(), "[server-stream] finished repeating");
            Ok(session.count())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Answers every message on a bidirectional stream until the client
    /// finishes sending
    ///
    /// Each message is answered before the next one is read, so response
    /// indices follow arrival order. Returns how many messages were echoed.
    pub async fn stream<S, K>(&self, source: &mut S, sink: &mut K) -> Result<i32>
    where
        S: MessageSource<Message>,
        K: MessageSink<Response>,
    {
        async {
            let mut session = EchoSession::new();
            loop {
                let message = match source.receive().await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        info!(received = session.count(), "[bidi-stream] client finished sending");
                        return Ok(session.count());
                    }
                    Err(status) => {
                        return Err(EchoError::transport(
                            CallShape::Bidirectional,
                            Direction::Receive,
                            status,
                        ));
                    }
                };

                let response = session.stamp(message).map_err(|status| {
                    EchoError::transport(CallShape::Bidirectional, Direction::Send, status)
                })?;
                info!(
                    index = response.index,
                    preview = %response.message.preview(),
                    received_at = %response.received_at,
                    "[bidi-stream] replying"
                );
                sink.send(response).await.map_err(|status| {
                    EchoError::transport(CallShape::Bidirectional, Direction::Send, status)
                })?;
            }
        }
        .instrument(self.span.clone())
        .await
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Code;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Source replaying a script of receive outcomes, then end-of-stream
    struct ScriptedSource {
        script: VecDeque<std::result::Result<Message, Status>>,
    }

    impl ScriptedSource {
        fn messages(count: usize) -> Self {
            Self {
                script: (0..count)
                    .map(|i| Ok(Message::from(format!("hello-{i}"))))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl MessageSource<Message> for ScriptedSource {
        async fn receive(&mut self) -> std::result::Result<Option<Message>, Status> {
            match self.script.pop_front() {
                Some(Ok(message)) => Ok(Some(message)),
                Some(Err(status)) => Err(status),
                None => Ok(None),
            }
        }
    }

    /// Sink collecting responses, failing on the send with position `fail_at`
    #[derive(Default)]
    struct CollectingSink {
        sent: Vec<Response>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl MessageSink<Response> for CollectingSink {
        async fn send(&mut self, item: Response) -> std::result::Result<(), Status> {
            if self.fail_at == Some(self.sent.len()) {
                return Err(Status::unavailable("connection reset"));
            }
            self.sent.push(item);
            Ok(())
        }
    }

    #[test]
    fn test_session_indices_start_at_one() {
        let mut session = EchoSession::new();
        assert_eq!(session.count(), 0);
        let first = session.stamp(Message::from("a")).unwrap();
        let second = session.stamp(Message::from("b")).unwrap();
        assert_eq!((first.index, second.index), (1, 2));
        assert!(second.received_at >= first.received_at);
    }

    #[test]
    fn test_session_refuses_to_wrap() {
        let mut session = EchoSession {
            counter: i32::MAX,
        };
        let err = session.stamp(Message::from("a")).unwrap_err();
        assert_eq!(err.code, Code::Internal);
    }

    #[tokio::test]
    async fn test_stream_replies_once_per_message_in_order() {
        let handler = EchoHandler::new();
        let mut source = ScriptedSource::messages(10);
        let mut sink = CollectingSink::default();

        let echoed = handler.stream(&mut source, &mut sink).await.unwrap();

        assert_eq!(echoed, 10);
        for (i, response) in sink.sent.iter().enumerate() {
            assert_eq!(response.index, i as i32 + 1);
            assert_eq!(response.message, Message::from(format!("hello-{i}")));
        }
        assert!(
            sink.sent
                .windows(2)
                .all(|pair| pair[0].received_at <= pair[1].received_at)
        );
    }

    #[tokio::test]
    async fn test_stream_with_no_messages_ends_cleanly() {
        let handler = EchoHandler::new();
        let mut sink = CollectingSink::default();
        let echoed = handler
            .stream(&mut ScriptedSource::messages(0), &mut sink)
            .await
            .unwrap();
        assert_eq!(echoed, 0);
        assert!(sink.sent.is_empty());
    }

    #[tokio::test]
    async fn test_stream_receive_failure_names_direction() {
        let handler = EchoHandler::new();
        let mut source = ScriptedSource {
            script: VecDeque::from([
                Ok(Message::from("one")),
                Err(Status::deadline_exceeded("call deadline elapsed")),
                Ok(Message::from("never read")),
            ]),
        };
        let mut sink = CollectingSink::default();

        let err = handler.stream(&mut source, &mut sink).await.unwrap_err();

        assert!(matches!(
            err,
            EchoError::Transport {
                shape: CallShape::Bidirectional,
                direction: Direction::Receive,
                ..
            }
        ));
        assert!(err.is_deadline_exceeded());
        assert_eq!(sink.sent.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_send_failure_stops_consuming() {
        let handler = EchoHandler::new();
        let mut source = ScriptedSource::messages(5);
        let mut sink = CollectingSink {
            fail_at: Some(2),
            ..Default::default()
        };

        let err = handler.stream(&mut source, &mut sink).await.unwrap_err();

        assert!(matches!(
            err,
            EchoError::Transport {
                direction: Direction::Send,
                ..
            }
        ));
        // Third message was taken, its reply failed, nothing after was read
        assert_eq!(source.script.len(), 2);
    }

    #[tokio::test]
    async fn test_repeat_emits_count_responses() {
        let handler = EchoHandler::new();
        let mut sink = CollectingSink::default();
        let request = RepeatRequest {
            message: Message::from("again"),
            count: 3,
        };

        assert_eq!(handler.repeat(request, &mut sink).await.unwrap(), 3);
        let indices: Vec<i32> = sink.sent.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_unary_captures_time_at_entry() {
        let before = Utc::now();
        let response = EchoHandler::new().unary(Message::from("Hi there"));
        assert!(response.received_at >= before);
        assert!(response.received_at <= Utc::now());
    }

    #[test]
    fn test_injected_span_wraps_handler_logs() {
        let (logs, _guard) = crate::common::capture_logs();
        let handler = EchoHandler::with_span(tracing::info_span!("ping-handler"));

        handler.unary(Message::from("Hi there"));

        let output = logs.contents();
        assert!(output.contains("ping-handler"), "{output}");
        assert!(output.contains("[unary] echoing message"), "{output}");
    }
}
