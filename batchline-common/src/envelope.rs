//! Binary message envelope shared by clients and the server.
//!
//! # Frame layout
//!
//! All integers are big-endian.
//!
//! | field             | size            |
//! |-------------------|-----------------|
//! | version           | `u8`            |
//! | kind              | `u8`            |
//! | protocol tag      | `u8`            |
//! | origin id length  | `u16`           |
//! | origin id         | UTF-8 bytes     |
//! | request id        | `u64`           |
//! | partition index   | `u32`           |
//! | partition count   | `u32`           |
//! | payload length    | `u32`           |
//! | payload           | codec bytes     |
//!
//! ## Connection Flow
//!
//! 1. Client opens a WebSocket and sends `Hello` with its identity and protocol
//! 2. Server answers `HelloAck` (or `Error` and closes)
//! 3. Client sends `Request` / `StatusRequest` frames, each with a fresh request id
//! 4. Server answers `Reply`, `Partial`, `Error` or `StatusReply` with the same id

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Payload, ProtocolTag};
use crate::error::{ErrorBody, ProtocolError};

/// Protocol version constant.
pub const PROTOCOL_VERSION: u8 = 1;

const FIXED_HEADER_LEN: usize = 3 + 2;
const FIXED_BODY_LEN: usize = 8 + 4 + 4 + 4;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Hello,
    HelloAck,
    Request,
    Reply,
    /// Reply assembled from only some of the partitions.
    Partial,
    Error,
    StatusRequest,
    StatusReply,
}

impl EnvelopeKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Hello => 0,
            Self::HelloAck => 1,
            Self::Request => 2,
            Self::Reply => 3,
            Self::Partial => 4,
            Self::Error => 5,
            Self::StatusRequest => 6,
            Self::StatusReply => 7,
        }
    }

    pub fn from_u8(kind: u8) -> Result<Self, ProtocolError> {
        Ok(match kind {
            0 => Self::Hello,
            1 => Self::HelloAck,
            2 => Self::Request,
            3 => Self::Reply,
            4 => Self::Partial,
            5 => Self::Error,
            6 => Self::StatusRequest,
            7 => Self::StatusReply,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

/// A single framed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub origin_id: String,
    pub request_id: u64,
    pub partition_index: u32,
    pub partition_count: u32,
    pub protocol: ProtocolTag,
    pub payload: Bytes,
}

impl Envelope {
    fn raw(kind: EnvelopeKind, origin_id: &str, request_id: u64, protocol: ProtocolTag, payload: Bytes) -> Self {
        Self {
            kind,
            origin_id: origin_id.to_string(),
            request_id,
            partition_index: 0,
            partition_count: 1,
            protocol,
            payload,
        }
    }

    /// Envelope carrying an encoded payload.
    pub fn with_payload(
        kind: EnvelopeKind,
        origin_id: &str,
        request_id: u64,
        payload: &Payload,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            kind,
            origin_id,
            request_id,
            payload.protocol(),
            payload.encode()?,
        ))
    }

    /// Envelope carrying a serde value with the `obj` codec.
    pub fn with_json<T: Serialize>(
        kind: EnvelopeKind,
        origin_id: &str,
        request_id: u64,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let bytes = serde_json::to_vec(body).map_err(|e| ProtocolError::Json(e.to_string()))?;
        Ok(Self::raw(kind, origin_id, request_id, ProtocolTag::Obj, Bytes::from(bytes)))
    }

    pub fn request(origin_id: &str, request_id: u64, payload: &Payload) -> Result<Self, ProtocolError> {
        Self::with_payload(EnvelopeKind::Request, origin_id, request_id, payload)
    }

    pub fn reply(origin_id: &str, request_id: u64, payload: &Payload) -> Result<Self, ProtocolError> {
        Self::with_payload(EnvelopeKind::Reply, origin_id, request_id, payload)
    }

    /// Partial reply: `received` of `expected` partitions made it back.
    pub fn partial(
        origin_id: &str,
        request_id: u64,
        payload: &Payload,
        received: u32,
        expected: u32,
    ) -> Result<Self, ProtocolError> {
        let mut env = Self::with_payload(EnvelopeKind::Partial, origin_id, request_id, payload)?;
        env.partition_index = received;
        env.partition_count = expected;
        Ok(env)
    }

    pub fn error(origin_id: &str, request_id: u64, body: &ErrorBody) -> Self {
        // ErrorBody only holds an enum and a string, so JSON encoding cannot fail.
        let bytes = serde_json::to_vec(body).unwrap_or_default();
        Self::raw(
            EnvelopeKind::Error,
            origin_id,
            request_id,
            ProtocolTag::Obj,
            Bytes::from(bytes),
        )
    }

    /// Decode the payload with this envelope's protocol tag.
    pub fn decode_payload(&self) -> Result<Payload, ProtocolError> {
        Payload::decode(self.protocol, self.payload.clone())
    }

    /// Decode an `obj` payload into a typed body.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        if self.protocol != ProtocolTag::Obj {
            return Err(ProtocolError::Json(format!(
                "expected obj body, got {}",
                self.protocol
            )));
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Json(e.to_string()))
    }

    /// Serialize into one binary frame.
    pub fn encode(&self) -> Bytes {
        let origin = self.origin_id.as_bytes();
        let origin_len = origin.len().min(u16::MAX as usize);
        let mut buf =
            BytesMut::with_capacity(FIXED_HEADER_LEN + origin_len + FIXED_BODY_LEN + self.payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(self.protocol.as_u8());
        buf.put_u16(origin_len as u16);
        buf.extend_from_slice(&origin[..origin_len]);
        buf.put_u64(self.request_id);
        buf.put_u32(self.partition_index);
        buf.put_u32(self.partition_count);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one binary frame.
    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        need(&frame, FIXED_HEADER_LEN)?;
        let version = frame.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let kind = EnvelopeKind::from_u8(frame.get_u8())?;
        let protocol = ProtocolTag::from_u8(frame.get_u8())?;
        let origin_len = frame.get_u16() as usize;
        need(&frame, origin_len)?;
        let origin_id = String::from_utf8(frame.split_to(origin_len).to_vec())
            .map_err(|_| ProtocolError::InvalidOrigin)?;
        need(&frame, FIXED_BODY_LEN)?;
        let request_id = frame.get_u64();
        let partition_index = frame.get_u32();
        let partition_count = frame.get_u32();
        let payload_len = frame.get_u32() as usize;
        need(&frame, payload_len)?;
        let payload = frame.split_to(payload_len);
        if frame.has_remaining() {
            return Err(ProtocolError::TrailingBytes(frame.remaining()));
        }
        Ok(Self {
            kind,
            origin_id,
            request_id,
            partition_index,
            partition_count,
            protocol,
            payload,
        })
    }
}

fn need(buf: &Bytes, len: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}
