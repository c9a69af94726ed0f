// src/codec.rs

//! Codec contract.
//!
//! A [`Codec`] turns [`Message`]s into frames and back, given the channel
//! they travel on. Concrete wire formats live outside this crate; the
//! in-crate [`JsonCodec`] exists as the reference implementation of the
//! contract (length-prefixed JSON) and is what the decode-semantics tests
//! run against.
//!
//! ## Decode semantics
//!
//! `decode` must never consume bytes without either producing a message or
//! returning [`DecodeResult::NeedMoreInput`]. On `NeedMoreInput` the caller
//! keeps the unread bytes and retries once more input arrives.
//!
//! ## Payload limit
//!
//! Encoders check the payload size against the endpoint's `payload` option
//! *before* writing anything, so an oversized message fails the send with
//! [`Error::PayloadTooLarge`] instead of leaving a partial frame on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Channel, ChannelPtr, Error, Message, Request, Result, Url};

/// Outcome of a decode attempt.
#[derive(Debug)]
pub enum DecodeResult {
    /// A complete message was decoded; its bytes were consumed.
    Message(Message),
    /// The buffer holds an incomplete frame; nothing was consumed.
    NeedMoreInput,
    /// The decoder skipped input it cannot interpret (e.g. telnet noise on
    /// an RPC port) and may be called again.
    SkipSomeInput,
}

/// Message/frame codec.
pub trait Codec: Send + Sync {
    /// Encode a message into `buf`.
    fn encode(&self, channel: &ChannelPtr, buf: &mut BytesMut, message: &Message) -> Result<()>;

    /// Attempt to decode one message from `buf`.
    fn decode(&self, channel: &ChannelPtr, buf: &mut BytesMut) -> Result<DecodeResult>;
}

/// Shared codec pointer.
pub type CodecPtr = Arc<dyn Codec>;

/// Encode-time payload size guard.
///
/// # Errors
///
/// Returns `Error::PayloadTooLarge` when `size` exceeds the endpoint's
/// `payload` option.
pub fn check_payload(url: &Url, size: usize) -> Result<()> {
    // ---
    let limit = url.payload_limit();
    if limit > 0 && size > limit {
        return Err(Error::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Codec registry keyed by configuration string.
///
/// Resolved once at construction time by whoever assembles a transport; no
/// runtime code generation, just a map.
pub struct CodecRegistry {
    codecs: HashMap<String, CodecPtr>,
}

impl CodecRegistry {
    // ---

    /// Empty registry.
    pub fn new() -> Self {
        // ---
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the reference codec registered under `"json"`.
    pub fn with_defaults() -> Self {
        // ---
        let mut registry = Self::new();
        registry.register("json", Arc::new(JsonCodec));
        registry
    }

    /// Register a codec under a name, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, codec: CodecPtr) {
        self.codecs.insert(name.into(), codec);
    }

    /// Resolve a codec by name.
    pub fn get(&self, name: &str) -> Option<CodecPtr> {
        self.codecs.get(name).cloned()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Reference codec: 4-byte big-endian length prefix followed by the JSON
/// rendering of the [`Message`].
///
/// If a frame body fails to parse as a message but its request id is still
/// recoverable, decoding yields a `broken` request carrying the decode error
/// text, so the peer can answer that specific call with a `BadRequest`
/// response instead of having the whole channel torn down.
pub struct JsonCodec;

const HEADER_LEN: usize = 4;

impl Codec for JsonCodec {
    // ---

    fn encode(&self, channel: &ChannelPtr, buf: &mut BytesMut, message: &Message) -> Result<()> {
        // ---
        check_payload(channel.url(), message.payload_len())?;

        let body = serde_json::to_vec(message)?;
        buf.reserve(HEADER_LEN + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(())
    }

    fn decode(&self, _channel: &ChannelPtr, buf: &mut BytesMut) -> Result<DecodeResult> {
        // ---
        if buf.len() < HEADER_LEN {
            return Ok(DecodeResult::NeedMoreInput);
        }

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < HEADER_LEN + body_len {
            return Ok(DecodeResult::NeedMoreInput);
        }

        buf.advance(HEADER_LEN);
        let body = buf.split_to(body_len);

        match serde_json::from_slice::<Message>(&body) {
            Ok(message) => Ok(DecodeResult::Message(message)),
            Err(err) => match recover_broken_request(&body, &err.to_string()) {
                Some(request) => Ok(DecodeResult::Message(Message::Request(request))),
                None => Err(Error::Decode(err.to_string())),
            },
        }
    }
}

/// Try to salvage the request id from an unparsable frame.
///
/// Returns a `broken` request whose payload carries the decode error text,
/// or `None` when the id itself is unrecoverable.
fn recover_broken_request(body: &[u8], error: &str) -> Option<Request> {
    // ---
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let request = value.get("Request")?;
    let id = request.get("id")?.as_i64()?;
    let two_way = request
        .get("two_way")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    Some(Request {
        id,
        two_way,
        broken: true,
        payload: Bytes::copy_from_slice(error.as_bytes()),
        ..Request::new(Bytes::new())
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transport::memory::test_channel;
    use crate::Response;

    fn encode_one(codec: &JsonCodec, channel: &ChannelPtr, message: &Message) -> BytesMut {
        // ---
        let mut buf = BytesMut::new();
        codec.encode(channel, &mut buf, message).unwrap();
        buf
    }

    #[tokio::test]
    async fn test_encode_decode() {
        // ---
        let channel = test_channel();
        let codec = JsonCodec;

        let request = Request::new(Bytes::from_static(b"hello"));
        let mut buf = encode_one(&codec, &channel, &Message::Request(request.clone()));

        match codec.decode(&channel, &mut buf).unwrap() {
            DecodeResult::Message(Message::Request(decoded)) => {
                assert_eq!(decoded.id, request.id);
                assert_eq!(decoded.payload, request.payload);
                assert!(decoded.two_way);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_partial_frame_preserves_buffer() {
        // ---
        let channel = test_channel();
        let codec = JsonCodec;

        let message = Message::Response(Response::ok(7, Bytes::from_static(b"ok")));
        let full = encode_one(&codec, &channel, &message);

        // Feed the frame one byte at a time; until the last byte arrives the
        // decoder must report NeedMoreInput without consuming anything.
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let before = buf.len();
            match codec.decode(&channel, &mut buf).unwrap() {
                DecodeResult::NeedMoreInput => {
                    assert!(i + 1 < full.len(), "complete frame not decoded");
                    assert_eq!(buf.len(), before);
                }
                DecodeResult::Message(Message::Response(resp)) => {
                    assert_eq!(i + 1, full.len());
                    assert_eq!(resp.id, 7);
                }
                other => panic!("unexpected decode result: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_broken_request_recovers_id() {
        // ---
        let channel = test_channel();
        let codec = JsonCodec;

        // Structurally valid JSON with a readable id but a bad payload type.
        let body = br#"{"Request":{"id":42,"two_way":true,"payload":123}}"#;
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        match codec.decode(&channel, &mut buf).unwrap() {
            DecodeResult::Message(Message::Request(req)) => {
                assert!(req.broken);
                assert_eq!(req.id, 42);
                assert!(!req.payload.is_empty());
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unrecoverable_frame_is_decode_error() {
        // ---
        let channel = test_channel();
        let codec = JsonCodec;

        let body = b"not json at all";
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body.as_slice());

        assert!(matches!(
            codec.decode(&channel, &mut buf),
            Err(Error::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_payload_limit() {
        // ---
        let channel = test_channel_with_limit(16);
        let codec = JsonCodec;

        let message = Message::Request(Request::new(Bytes::from(vec![0u8; 64])));
        let mut buf = BytesMut::new();
        match codec.encode(&channel, &mut buf, &message) {
            Err(Error::PayloadTooLarge { size, limit }) => {
                assert_eq!(size, 64);
                assert_eq!(limit, 16);
            }
            other => panic!("unexpected encode result: {other:?}"),
        }
        // Nothing written on failure.
        assert!(buf.is_empty());
    }

    fn test_channel_with_limit(limit: usize) -> ChannelPtr {
        // ---
        crate::transport::memory::test_channel_with_url(
            crate::Url::new("mem", "localhost", 0).with_param("payload", limit.to_string()),
        )
    }
}
