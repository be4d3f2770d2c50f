// RPC envelope types for the parley session protocol.
//
// Client -> server: `{id, method, params}` (request, streaming request or post).
// Server -> client: `{id, result}`, `{id, error}`, `{id, end: true, result}`
// and unsolicited pushes reusing the request shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ErrorCode;

pub const PROTOCOL_VERSION: &str = "parley-rpc.v2";

/// Numeric call identifier, unique within one connection's lifetime.
pub type CallId = u64;

/// A client call. Whether it expects a reply, a stream or nothing is
/// decided by the method name, never by the envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: CallId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Wire error object carried by error responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: u16,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: code.code(), message: message.into() }
    }

    /// Resolve the numeric code back into the canonical table.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

/// Every frame the server may send.
///
/// Variant order matters for untagged decoding: a stream end also carries
/// `id` and `result`, so it must be tried before the plain result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    StreamEnd { id: CallId, end: bool, result: Value },
    Error { id: Option<CallId>, error: RpcError },
    Result { id: CallId, result: Value },
    Push { id: CallId, method: String, params: Value },
}

impl Request {
    pub fn new(id: CallId, method: impl Into<String>, params: Value) -> Self {
        Self { id, method: method.into(), params }
    }
}

impl ServerMessage {
    pub fn result(id: CallId, result: Value) -> Self {
        Self::Result { id, result }
    }

    pub fn error(id: Option<CallId>, error: RpcError) -> Self {
        Self::Error { id, error }
    }

    pub fn stream_end(id: CallId, result: Value) -> Self {
        Self::StreamEnd { id, end: true, result }
    }

    pub fn push(id: CallId, method: impl Into<String>, params: Value) -> Self {
        Self::Push { id, method: method.into(), params }
    }

    /// Call id this frame answers, if any. Pushes answer nothing.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::StreamEnd { id, .. } | Self::Result { id, .. } => Some(*id),
            Self::Error { id, .. } => *id,
            Self::Push { .. } => None,
        }
    }

    /// True for frames after which no further frame may carry the same id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamEnd { .. } | Self::Error { .. })
    }
}
