// src/message.rs

//! Request/Response message model.
//!
//! [`Request`] and [`Response`] are immutable value objects: a request is
//! discarded once sent, a response once delivered. Heartbeats and read-only
//! notices are ordinary requests/responses tagged with an [`EventKind`], so
//! every special case is an explicit enum variant rather than a flag to sniff.
//!
//! Request ids come from a process-wide counter. The id wraps on overflow and
//! may go negative; the contract is uniqueness among outstanding calls, never
//! ordering.

use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol version carried by newly created requests.
pub const DEFAULT_VERSION: &str = "1.0";

/// Process-wide request id source.
static NEXT_ID: AtomicI64 = AtomicI64::new(0);

/// Allocate a fresh correlation id.
///
/// Uniqueness-only contract: the counter wraps at `i64::MAX` and continues
/// into negative values. Callers must not infer ordering from ids.
pub fn next_request_id() -> i64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reserved event markers carried by requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Liveness probe. Intercepted by the exchange layer and never delivered
    /// to business handlers.
    Heartbeat,
    /// Peer-is-read-only notice.
    ReadOnly,
}

/// An RPC request.
///
/// Created through the constructors below; fields are read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique among outstanding calls.
    pub id: i64,
    /// Protocol version string.
    pub version: String,
    /// `true` when a correlated [`Response`] is expected.
    pub two_way: bool,
    /// Reserved event marker, if any.
    pub event: Option<EventKind>,
    /// Set by decoders when the frame was unparsable but the id was still
    /// recoverable; the payload then carries the decode error text.
    pub broken: bool,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Request {
    // ---

    /// Create a two-way request with a fresh id.
    pub fn new(payload: Bytes) -> Self {
        // ---
        Self {
            id: next_request_id(),
            version: DEFAULT_VERSION.to_owned(),
            two_way: true,
            event: None,
            broken: false,
            payload,
        }
    }

    /// Create a one-way (fire-and-forget) request.
    pub fn oneway(payload: Bytes) -> Self {
        // ---
        Self {
            two_way: false,
            ..Self::new(payload)
        }
    }

    /// Create a two-way heartbeat request.
    pub fn heartbeat() -> Self {
        // ---
        Self {
            event: Some(EventKind::Heartbeat),
            ..Self::new(Bytes::new())
        }
    }

    /// Create a one-way read-only event notice.
    pub fn read_only() -> Self {
        // ---
        Self {
            event: Some(EventKind::ReadOnly),
            ..Self::oneway(Bytes::new())
        }
    }

    /// Whether this request is a heartbeat probe.
    pub fn is_heartbeat(&self) -> bool {
        self.event == Some(EventKind::Heartbeat)
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    /// Call completed.
    Ok = 20,
    /// Client-side timeout.
    ClientTimeout = 30,
    /// Server-side timeout.
    ServerTimeout = 31,
    /// Request could not be decoded or was malformed.
    BadRequest = 40,
    /// Response could not be decoded or was malformed.
    BadResponse = 50,
    /// Business handler raised an error.
    ServiceError = 70,
    /// Internal server error.
    ServerError = 80,
    /// Internal client error.
    ClientError = 90,
}

impl Status {
    /// Decode a wire status byte.
    pub fn from_code(code: u8) -> Option<Self> {
        // ---
        match code {
            20 => Some(Self::Ok),
            30 => Some(Self::ClientTimeout),
            31 => Some(Self::ServerTimeout),
            40 => Some(Self::BadRequest),
            50 => Some(Self::BadResponse),
            70 => Some(Self::ServiceError),
            80 => Some(Self::ServerError),
            90 => Some(Self::ClientError),
            _ => None,
        }
    }

    /// Wire representation.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// An RPC response, correlated to the request carrying the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this response answers.
    pub id: i64,
    /// Outcome of the call.
    pub status: Status,
    /// Reserved event marker, if any.
    pub event: Option<EventKind>,
    /// Result payload (empty on error responses).
    pub payload: Bytes,
    /// Error description when `status` is not [`Status::Ok`].
    pub error: Option<String>,
}

impl Response {
    // ---

    /// Create a successful response for the given request id.
    pub fn ok(id: i64, payload: Bytes) -> Self {
        // ---
        Self {
            id,
            status: Status::Ok,
            event: None,
            payload,
            error: None,
        }
    }

    /// Create a heartbeat reply for the given request id.
    pub fn heartbeat(id: i64) -> Self {
        // ---
        Self {
            event: Some(EventKind::Heartbeat),
            ..Self::ok(id, Bytes::new())
        }
    }

    /// Create an error response.
    pub fn error(id: i64, status: Status, message: impl Into<String>) -> Self {
        // ---
        Self {
            id,
            status,
            event: None,
            payload: Bytes::new(),
            error: Some(message.into()),
        }
    }

    /// Whether this response is a heartbeat reply.
    pub fn is_heartbeat(&self) -> bool {
        self.event == Some(EventKind::Heartbeat)
    }
}

/// Everything that travels over an exchange channel.
///
/// Matched exhaustively wherever messages are dispatched, so heartbeat and
/// event handling can never be skipped by accident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// A request, two-way or one-way.
    Request(Request),
    /// A response to an earlier request.
    Response(Response),
}

impl Message {
    /// Size of the opaque payload carried by this message.
    pub fn payload_len(&self) -> usize {
        // ---
        match self {
            Message::Request(req) => req.payload.len(),
            Message::Response(resp) => resp.payload.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_ids_unique() {
        // ---
        let a = Request::new(Bytes::new());
        let b = Request::new(Bytes::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_heartbeat_shape() {
        // ---
        let req = Request::heartbeat();
        assert!(req.two_way);
        assert!(req.is_heartbeat());
        assert!(req.payload.is_empty());

        let resp = Response::heartbeat(req.id);
        assert_eq!(resp.id, req.id);
        assert!(resp.is_heartbeat());
        assert_eq!(resp.status, Status::Ok);
    }

    #[test]
    fn test_oneway() {
        // ---
        let req = Request::oneway(Bytes::from_static(b"x"));
        assert!(!req.two_way);
        assert!(!req.broken);
    }

    #[test]
    fn test_status_round_trip() {
        // ---
        for status in [
            Status::Ok,
            Status::ClientTimeout,
            Status::ServerTimeout,
            Status::BadRequest,
            Status::BadResponse,
            Status::ServiceError,
            Status::ServerError,
            Status::ClientError,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(0), None);
    }
}
