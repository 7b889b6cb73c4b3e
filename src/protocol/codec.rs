use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::Decoder;

use super::envelope::{Envelope, MsgType, UnknownMsgType};

/// Envelopes are newline-delimited JSON documents.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Envelope has an empty topic")]
    MissingTopic,
    #[error("Publish envelope carries no data")]
    MissingData,
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the connection may keep going after this error.
    ///
    /// Only an unrecognised `msg_type` is tolerated so that newer clients can
    /// talk to older hubs.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::UnknownMessageType(_))
    }
}

impl From<UnknownMsgType> for CodecError {
    fn from(err: UnknownMsgType) -> Self {
        CodecError::UnknownMessageType(err.0)
    }
}

// Decoding goes through a raw form so that an unknown `msg_type` can be told
// apart from a structurally broken document.
#[derive(Deserialize)]
struct RawEnvelope {
    client_id: String,
    msg_id: String,
    msg_type: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    data: Option<Value>,
}

pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), CodecError> {
    let json = serde_json::to_vec(envelope)?;
    buf.reserve(json.len() + 1);
    buf.put_slice(&json);
    buf.put_u8(FRAME_DELIMITER);
    Ok(())
}

pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    let raw: RawEnvelope = serde_json::from_slice(frame)?;
    let msg_type: MsgType = raw.msg_type.parse()?;

    if raw.topic.is_empty() {
        return Err(CodecError::MissingTopic);
    }

    let data = raw.data.filter(|value| !value.is_null());
    if msg_type == MsgType::Publish && data.is_none() {
        return Err(CodecError::MissingData);
    }

    Ok(Envelope {
        client_id: raw.client_id,
        msg_id: raw.msg_id,
        msg_type,
        topic: raw.topic,
        data,
    })
}

/// Splits a byte stream into newline-delimited frames.
///
/// Remembers how far the buffered bytes were already searched, so a frame
/// arriving in many small reads is scanned once. The delimiter and a trailing
/// carriage return are stripped. Blank lines come back as empty frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    next_index: usize,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            next_index: 0,
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        // A delimiter past max_frame_size would end an oversized frame anyway.
        let scan_end = buf.len().min(self.max_frame_size + 1);
        let scan_start = self.next_index.min(scan_end);

        match buf[scan_start..scan_end]
            .iter()
            .position(|&b| b == FRAME_DELIMITER)
        {
            Some(offset) => {
                let pos = scan_start + offset;
                self.next_index = 0;
                let mut line = buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                Ok(Some(line.freeze()))
            }
            None if buf.len() > self.max_frame_size => {
                self.next_index = 0;
                Err(CodecError::FrameTooLarge {
                    size: buf.len(),
                    limit: self.max_frame_size,
                })
            }
            None => {
                self.next_index = scan_end;
                Ok(None)
            }
        }
    }
}
