use super::echo::EchoHandler;
use crate::proto::{Message, Method, RepeatRequest, Response, Status};
use crate::transport::{RecvHalf, ServerCall};
use crate::{CallShape, Direction, EchoError, Result};
use serde::de::DeserializeOwned;

/// Routes calls on a named service to the [`EchoHandler`]
///
/// The service name only changes method paths, so a "ping" service and a
/// "message" service are the same handler under two names.
#[derive(Debug, Clone)]
pub struct EchoService {
    name: String,
    handler: EchoHandler,
}

impl EchoService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: EchoHandler::new(),
        }
    }

    pub fn with_handler(mut self, handler: EchoHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves a full method path, e.g. `"echo/Stream"`
    pub fn route(&self, path: &str) -> Option<Method> {
        Method::route(&self.name, path)
    }

    /// Runs one accepted call to completion
    pub async fn call(&self, method: Method, call: ServerCall) -> Result<()> {
        match method {
            Method::Echo => {
                let (mut sink, mut source) = call.into_session::<Response, Message>().split();
                let message = read_request(&mut source, CallShape::Unary).await?;
                sink.send(self.handler.unary(message))
                    .await
                    .map_err(|status| EchoError::transport(CallShape::Unary, Direction::Send, status))
            }
            Method::Repeat => {
                let (mut sink, mut source) = call.into_session::<Response, RepeatRequest>().split();
                let request = read_request(&mut source, CallShape::ServerStreaming).await?;
                self.handler.repeat(request, &mut sink).await.map(|_| ())
            }
            Method::Stream => {
                let (mut sink, mut source) = call.into_session::<Response, Message>().split();
                self.handler.stream(&mut source, &mut sink).await.map(|_| ())
            }
        }
    }
}

async fn read_request<T: DeserializeOwned>(source: &mut RecvHalf<T>, shape: CallShape) -> Result<T> {
    match source.receive().await {
        Ok(Some(request)) => Ok(request),
        Ok(None) => Err(EchoError::transport(
            shape,
            Direction::Receive,
            Status::invalid_argument("call finished before sending a request"),
        )),
        Err(status) => Err(EchoError::transport(shape, Direction::Receive, status)),
    }
}
