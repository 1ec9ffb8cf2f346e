//! Framed codec for byte-stream transports.
//!
//! 4-byte length prefix (LengthDelimitedCodec) around a serde_json body.
//! Outbound frames are typed messages. Transports read inbound frames as raw
//! bytes through [`frame_delimiter`], so a frame that is not JSON can be
//! skipped without losing the stream.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on one frame. Larger frames are a protocol violation.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 256 * 1024;

pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: frame_delimiter(max),
            _item: PhantomData,
        }
    }
}

/// Length-prefix framing shared by [`FrameCodec`] and raw frame readers.
pub fn frame_delimiter(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if body.len() > LARGE_FRAME_BYTES {
            tracing::debug!(frame_bytes = body.len(), "Encoding large frame");
        }
        self.inner.encode(Bytes::from(body), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventMessage, Message, RequestMessage};
    use serde_json::{Value, json};

    #[test]
    fn encoded_message_decodes_as_raw_value() {
        let mut encoder = FrameCodec::<Message>::new();
        let mut decoder = FrameCodec::<Value>::new();
        let mut buf = BytesMut::new();

        let req = RequestMessage::new("msg_9_9", "math:add", json!([1, 2]));
        encoder.encode(Message::from(req), &mut buf).unwrap();
        let raw = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(raw["id"], json!("msg_9_9"));
        assert_eq!(raw["needResponse"], json!(true));
        assert_eq!(raw["payload"], json!([1, 2]));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut encoder = FrameCodec::<Message>::new();
        let mut decoder = FrameCodec::<Value>::new();
        let mut full = BytesMut::new();
        encoder
            .encode(Message::from(EventMessage::new("a:b", json!("x"))), &mut full)
            .unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full);
        assert!(decoder.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn non_json_frame_is_invalid_data() {
        let mut raw_codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw_codec
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();

        let err = FrameCodec::<Value>::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut encoder = FrameCodec::<Value>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        assert!(encoder.encode(json!("this string is too long"), &mut buf).is_err());
    }
}
