use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured content record carried by a [`Message::Content`]
///
/// # Examples
///
/// ```
/// use echorpc::proto::Content;
///
/// let content = Content::new("Hi there", "Sample Client");
/// assert_eq!(content.body, "Hi there");
/// assert_eq!(content.author, "Sample Client");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Free-form message text
    pub body: String,
    /// Who wrote the message
    pub author: String,
    /// Client-side creation time
    pub created_at: DateTime<Utc>,
}

impl Content {
    /// Creates a content record stamped with the current time
    pub fn new(body: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            author: author.into(),
            created_at: Utc::now(),
        }
    }
}

/// A single inbound unit: either a plain text body or a structured record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Message {
    Text(String),
    Content(Content),
}

impl Message {
    /// Short human-readable rendering used in log lines
    pub fn preview(&self) -> &str {
        match self {
            Message::Text(text) => text,
            Message::Content(content) => &content.body,
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<Content> for Message {
    fn from(content: Content) -> Self {
        Message::Content(content)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text(text) => write!(f, "{text}"),
            Message::Content(content) => write!(f, "{} ({})", content.body, content.author),
        }
    }
}

/// Server reply correlated to exactly one received [`Message`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Position of the correlated message within its call, starting at 1
    pub index: i32,
    /// Server capture time for the correlated message
    pub received_at: DateTime<Utc>,
    /// Echo of the inbound content
    pub message: Message,
}

/// Request for the unary-request / streamed-response call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatRequest {
    pub message: Message,
    /// How many responses the server should emit
    pub count: u32,
}
