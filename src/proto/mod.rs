//! Wire types shared by clients and servers
//!
//! Message units, call status and the frame codec that carries both over a
//! connection.

pub mod frame;
pub mod message;
pub mod method;
pub mod status;

pub use frame::{CallId, Frame, FrameCodec, FrameError};
pub use message::{Content, Message, RepeatRequest, Response};
pub use method::Method;
pub use status::{Code, Status};
