// Metadata path parsing: `[namespace, id?]` segments, key validation.
//
// Canonical namespaces:
//   ["global"]            server-wide
//   ["model", <id>]       per model
//   ["user"]              caller's private namespace
//   ["userPublic", <id>]  per user, readable by everyone
//   ["chat", <id>]        per chat, lock holder only

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ChatId, ModelId, UserId};

/// Maximum allowed metadata key length in characters.
pub const MAX_KEY_CHARS: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("metadata path is empty")]
    Empty,

    #[error("unknown metadata namespace `{0}`")]
    UnknownNamespace(String),

    #[error("metadata namespace `{0}` requires an id segment")]
    MissingId(String),

    #[error("metadata namespace `{namespace}` takes {expected} segment(s), got {actual}")]
    SegmentCount { namespace: String, expected: usize, actual: usize },

    #[error("invalid user id `{0}` in metadata path")]
    InvalidUserId(String),

    #[error("metadata key is empty")]
    EmptyKey,

    #[error("metadata key exceeds maximum length of {MAX_KEY_CHARS} characters")]
    KeyTooLong,

    #[error("metadata key contains null byte")]
    NullByte,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub enum MetadataPath {
    Global,
    Model(ModelId),
    User,
    UserPublic(UserId),
    Chat(ChatId),
}

impl MetadataPath {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Model(_) => "model",
            Self::User => "user",
            Self::UserPublic(_) => "userPublic",
            Self::Chat(_) => "chat",
        }
    }

    pub fn parse(segments: &[String]) -> Result<Self, PathError> {
        let (namespace, rest) = segments.split_first().ok_or(PathError::Empty)?;
        let expect = |expected: usize| {
            if segments.len() == expected {
                Ok(())
            } else if segments.len() < expected {
                Err(PathError::MissingId(namespace.clone()))
            } else {
                Err(PathError::SegmentCount {
                    namespace: namespace.clone(),
                    expected,
                    actual: segments.len(),
                })
            }
        };
        let id = || rest.first().map(|id| id.trim()).filter(|id| !id.is_empty());

        match namespace.as_str() {
            "global" => expect(1).map(|_| Self::Global),
            "user" => expect(1).map(|_| Self::User),
            "model" => {
                expect(2)?;
                let id = id().ok_or_else(|| PathError::MissingId(namespace.clone()))?;
                Ok(Self::Model(id.to_string()))
            }
            "chat" => {
                expect(2)?;
                let id = id().ok_or_else(|| PathError::MissingId(namespace.clone()))?;
                Ok(Self::Chat(id.to_string()))
            }
            "userPublic" => {
                expect(2)?;
                let raw = id().ok_or_else(|| PathError::MissingId(namespace.clone()))?;
                let user_id =
                    Uuid::parse_str(raw).map_err(|_| PathError::InvalidUserId(raw.to_string()))?;
                Ok(Self::UserPublic(user_id))
            }
            other => Err(PathError::UnknownNamespace(other.to_string())),
        }
    }

    pub fn segments(&self) -> Vec<String> {
        let mut segments = vec![self.namespace().to_string()];
        match self {
            Self::Global | Self::User => {}
            Self::Model(id) | Self::Chat(id) => segments.push(id.clone()),
            Self::UserPublic(user_id) => segments.push(user_id.to_string()),
        }
        segments
    }
}

impl TryFrom<Vec<String>> for MetadataPath {
    type Error = PathError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MetadataPath> for Vec<String> {
    fn from(value: MetadataPath) -> Self {
        value.segments()
    }
}

impl fmt::Display for MetadataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments().join("/"))
    }
}

/// Validate a metadata key and return it trimmed.
pub fn normalize_key(key: &str) -> Result<String, PathError> {
    if key.contains('\0') {
        return Err(PathError::NullByte);
    }
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(PathError::EmptyKey);
    }
    if trimmed.chars().count() > MAX_KEY_CHARS {
        return Err(PathError::KeyTooLong);
    }
    Ok(trimmed.to_string())
}
