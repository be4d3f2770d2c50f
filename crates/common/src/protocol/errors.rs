// Canonical error-code registry.
//
// The numeric HTTP-inspired table is authoritative. The older symbolic
// names (OUTDATED, BUSY, LOCK_NOT_HELD, STREAM_INTERRUPTED) are accepted by
// `from_legacy_name` and folded onto it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotModified,
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    LockNotHeld,
    Locked,
    StreamInterrupted,
    InternalServerError,
    NotImplemented,
    BadGateway,
}

/// Coarse grouping used by clients to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-sync and retry; never retried by the server.
    Staleness,
    /// Surface to a human; automatic retry is discouraged.
    Contention,
    Authorization,
    NotFound,
    Backend,
    Request,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 11] = [
        Self::NotModified,
        Self::BadRequest,
        Self::Unauthorized,
        Self::NotFound,
        Self::Conflict,
        Self::LockNotHeld,
        Self::Locked,
        Self::StreamInterrupted,
        Self::InternalServerError,
        Self::NotImplemented,
        Self::BadGateway,
    ];

    pub const fn code(self) -> u16 {
        match self {
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::LockNotHeld => 412,
            Self::Locked => 423,
            Self::StreamInterrupted => 499,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.code() == code)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotModified => "NOT_MODIFIED",
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::LockNotHeld => "LOCK_NOT_HELD",
            Self::Locked => "LOCKED",
            Self::StreamInterrupted => "STREAM_INTERRUPTED",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::BadGateway => "BAD_GATEWAY",
        }
    }

    /// Map a symbolic name from the earlier protocol generation.
    pub fn from_legacy_name(name: &str) -> Option<Self> {
        match name {
            "OUTDATED" => Some(Self::Conflict),
            "BUSY" => Some(Self::Locked),
            "LOCK_NOT_HELD" => Some(Self::LockNotHeld),
            "STREAM_INTERRUPTED" => Some(Self::StreamInterrupted),
            "NOT_FOUND" => Some(Self::NotFound),
            _ => None,
        }
    }

    pub const fn class(self) -> ErrorClass {
        match self {
            Self::NotModified | Self::Conflict => ErrorClass::Staleness,
            Self::Locked | Self::LockNotHeld => ErrorClass::Contention,
            Self::Unauthorized => ErrorClass::Authorization,
            Self::NotFound => ErrorClass::NotFound,
            Self::StreamInterrupted | Self::InternalServerError | Self::BadGateway => {
                ErrorClass::Backend
            }
            Self::BadRequest | Self::NotImplemented => ErrorClass::Request,
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::NotModified => "cached copy is current",
            Self::BadRequest => "request is malformed",
            Self::Unauthorized => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::Conflict => "reference version is stale",
            Self::LockNotHeld => "caller does not hold the chat lock",
            Self::Locked => "chat is locked by an active stream",
            Self::StreamInterrupted => "stream was interrupted",
            Self::InternalServerError => "internal server error",
            Self::NotImplemented => "method not implemented",
            Self::BadGateway => "inference backend failed",
        }
    }
}
