use super::status::Status;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Identifies one call within a connection
pub type CallId = u32;

/// Default upper bound for a single encoded frame
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Unit of exchange on a connection
///
/// Every frame names the call it belongs to so that many calls can share
/// one connection. Payloads stay as raw JSON values here and are decoded
/// into typed messages by the session that owns the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client opens a call on `method`
    Open {
        call: CallId,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authority: Option<String>,
        /// Messages the client is ready to receive before granting more credit
        window: u32,
    },
    /// One message unit, either direction
    Message {
        call: CallId,
        payload: serde_json::Value,
    },
    /// Receiver is ready for `count` more messages on this call, either direction
    Credit { call: CallId, count: u32 },
    /// Client will send no more messages on this call
    HalfClose { call: CallId },
    /// Client abandoned the call
    Cancel { call: CallId },
    /// Server trailer; `Ok` means clean end-of-stream
    Close { call: CallId, status: Status },
}

impl Frame {
    pub fn call(&self) -> CallId {
        match self {
            Frame::Open { call, .. }
            | Frame::Message { call, .. }
            | Frame::Credit { call, .. }
            | Frame::HalfClose { call }
            | Frame::Cancel { call }
            | Frame::Close { call, .. } => *call,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-prefixed JSON frame codec
///
/// Each frame is a 4-byte big-endian length followed by the JSON encoding
/// of a [`Frame`].
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let encoded = serde_json::to_vec(&frame)?;
        self.inner.encode(Bytes::from(encoded), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_handles_partial_input() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::HalfClose { call: 7 }, &mut buf)
            .unwrap();
        codec
            .encode(
                Frame::Close {
                    call: 7,
                    status: Status::ok(),
                },
                &mut buf,
            )
            .unwrap();

        // Feed the first frame one byte short
        let first_len = 4 + u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let mut partial = buf.split_to(first_len - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Frame::HalfClose { call: 7 })
        );
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Frame::Close {
                call: 7,
                status: Status::ok()
            })
        );
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_open_frame_omits_empty_options() {
        let frame = Frame::Open {
            call: 1,
            method: "echo/Stream".to_string(),
            timeout_ms: None,
            authority: None,
            window: 8,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "open");
        assert!(json.get("timeout_ms").is_none());
        assert!(json.get("authority").is_none());
        assert_eq!(json["window"], 8);
        assert_eq!(frame.call(), 1);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        let result = codec.encode(
            Frame::Message {
                call: 1,
                payload: serde_json::Value::String("x".repeat(64)),
            },
            &mut buf,
        );
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"nope!");
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::Json(_))));
    }
}
