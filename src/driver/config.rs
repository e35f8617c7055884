use crate::proto::{Content, Message};
use std::time::Duration;

/// What each message of a burst carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BurstContent {
    /// Text messages `"{prefix}-0"`, `"{prefix}-1"`, ...
    Text { prefix: String },
    /// The same structured record for every message
    Content { body: String, author: String },
}

impl BurstContent {
    /// Message sent at position `position` of the burst
    pub fn message_at(&self, position: usize) -> Message {
        match self {
            BurstContent::Text { prefix } => Message::Text(format!("{prefix}-{position}")),
            BurstContent::Content { body, author } => {
                Message::Content(Content::new(body.as_str(), author.as_str()))
            }
        }
    }
}

impl Default for BurstContent {
    fn default() -> Self {
        BurstContent::Text {
            prefix: "hello".to_string(),
        }
    }
}

/// Configuration for a bidirectional burst
///
/// # Examples
///
/// ```
/// use echorpc::BurstConfig;
/// use std::time::Duration;
///
/// let config = BurstConfig::default().with_count(3);
/// assert_eq!(config.count, 3);
/// assert_eq!(config.deadline, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct BurstConfig {
    /// Number of messages to send
    pub count: usize,
    pub content: BurstContent,
    /// Deadline for the whole stream, from open to end-of-stream
    pub deadline: Duration,
}

impl BurstConfig {
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_content(mut self, content: BurstContent) -> Self {
        self.content = content;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            count: 10,
            content: BurstContent::default(),
            deadline: Duration::from_secs(10),
        }
    }
}
