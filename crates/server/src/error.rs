use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_common::history::HistoryError;
use parley_common::metadata::PathError;
use parley_common::protocol::errors::ErrorCode;
use parley_common::protocol::rpc::RpcError;
use serde_json::json;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Structured failure of one RPC call. Every handler reports exactly one of
/// these; there is no partial success.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct ServiceError {
    code: ErrorCode,
    message: String,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{what} `{id}` not found"))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalServerError, message)
    }

    pub fn into_rpc(self) -> RpcError {
        RpcError { code: self.code.code(), message: self.message }
    }
}

impl From<ServiceError> for RpcError {
    fn from(error: ServiceError) -> Self {
        error.into_rpc()
    }
}

/// Plain HTTP rendering, used before a socket exists (upgrade rejection).
impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.into_rpc() }))).into_response()
    }
}

impl From<PathError> for ServiceError {
    fn from(error: PathError) -> Self {
        Self::bad_request(error.to_string())
    }
}

impl From<HistoryError> for ServiceError {
    fn from(error: HistoryError) -> Self {
        match error {
            HistoryError::UnknownParent(_) => Self::bad_request(error.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_common::history::HistoryError;
    use parley_common::metadata::PathError;
    use parley_common::protocol::errors::ErrorCode;
    use parley_common::protocol::rpc::RpcError;

    use super::ServiceError;

    #[test]
    fn from_code_uses_registry_message() {
        let error = ServiceError::from_code(ErrorCode::Locked);
        assert_eq!(error.code(), ErrorCode::Locked);
        assert_eq!(error.message(), "chat is locked by an active stream");
        assert_eq!(error.to_string(), "LOCKED: chat is locked by an active stream");
    }

    #[test]
    fn converts_into_numeric_wire_error() {
        let rpc: RpcError = ServiceError::not_found("chat", "c1").into();
        assert_eq!(rpc.code, 404);
        assert_eq!(rpc.message, "chat `c1` not found");
    }

    #[test]
    fn library_errors_map_to_bad_request() {
        assert_eq!(ServiceError::from(PathError::EmptyKey).code(), ErrorCode::BadRequest);
        assert_eq!(
            ServiceError::from(HistoryError::UnknownParent("n".into())).code(),
            ErrorCode::BadRequest
        );
        assert_eq!(
            ServiceError::from(HistoryError::Cycle("n".into())).code(),
            ErrorCode::InternalServerError
        );
    }

    #[test]
    fn http_rendering_uses_numeric_status() {
        use axum::response::IntoResponse;

        let response = ServiceError::unauthorized("missing credentials").into_response();
        assert_eq!(response.status().as_u16(), 401);
        let response = ServiceError::new(ErrorCode::StreamInterrupted, "gone").into_response();
        assert_eq!(response.status().as_u16(), 499);
    }
}
