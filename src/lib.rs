use crate::proto::{Code, FrameError, Status};
use std::fmt;
use thiserror::Error;

/// Which shape of call an error occurred on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    ServerStreaming,
    Bidirectional,
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallShape::Unary => f.write_str("unary"),
            CallShape::ServerStreaming => f.write_str("server-streaming"),
            CallShape::Bidirectional => f.write_str("bidirectional"),
        }
    }
}

/// Which direction of a call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// Error types for the echorpc library
#[derive(Error, Debug)]
pub enum EchoError {
    /// Could not establish a connection to the server
    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Could not bind the listening socket
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The call could not be opened, e.g. the method is not routable
    #[error("Failed to open call {method}: {status}")]
    CallOpen { method: String, status: Status },

    /// A call failed mid-flight on one of its directions
    #[error("{direction} failed on {shape} call: {status}")]
    Transport {
        shape: CallShape,
        direction: Direction,
        status: Status,
    },

    /// Socket-level errors outside of any call
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or frame encoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<FrameError> for EchoError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => EchoError::Io(e),
            FrameError::Json(e) => EchoError::Codec(e),
        }
    }
}

impl EchoError {
    pub fn transport(shape: CallShape, direction: Direction, status: Status) -> Self {
        EchoError::Transport {
            shape,
            direction,
            status,
        }
    }

    /// Classifies a failed session operation on a client call
    ///
    /// The server answers an unroutable method with `Unimplemented`, which
    /// the client only learns about once it reads the call.
    pub fn on_call(method: &str, shape: CallShape, direction: Direction, status: Status) -> Self {
        if status.code == Code::Unimplemented {
            EchoError::CallOpen {
                method: method.to_string(),
                status,
            }
        } else {
            EchoError::transport(shape, direction, status)
        }
    }

    /// The call status behind this error, if it came from a call
    pub fn status(&self) -> Option<&Status> {
        match self {
            EchoError::CallOpen { status, .. } | EchoError::Transport { status, .. } => {
                Some(status)
            }
            _ => None,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.status()
            .is_some_and(|status| status.code == Code::DeadlineExceeded)
    }

    /// Status reported to the peer when a server-side call ends with this error
    pub fn to_status(&self) -> Status {
        match self.status() {
            Some(status) => status.clone(),
            None => Status::internal(self.to_string()),
        }
    }
}

/// Result type for the echorpc library
pub type Result<T> = std::result::Result<T, EchoError>;

pub mod common;
pub mod driver;
pub mod handler;
pub mod proto;
pub mod transport;

// Re-export main types for convenience
pub use common::{EchoServerTrait, MessageSink, MessageSource};
pub use driver::{BurstConfig, BurstContent, EchoClient, StreamDriver};
pub use handler::{EchoHandler, EchoService};
pub use proto::{Content, Message, Method, RepeatRequest, Response};
pub use transport::{
    Client, ConnectionConfig, DialOptions, RpcServer, SecurityMode, ServerConfig, StreamSession,
    TcpRpcServer,
};
