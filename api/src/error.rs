use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use consensus::ConsensusError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("Key not found: {0}")]
    NoSuchKey(String),

    #[error("Service not found: {0}")]
    NoSuchService(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Consensus(e) => match e {
                ConsensusError::NoLeader
                | ConsensusError::LeaderUnreachable(_)
                | ConsensusError::NotLeader(_) => (StatusCode::SERVICE_UNAVAILABLE, "NoLeader"),
                ConsensusError::Rejected(_) => (StatusCode::CONFLICT, "Rejected"),
                ConsensusError::ServiceNotFound(_) => (StatusCode::NOT_FOUND, "NoSuchService"),
                ConsensusError::NoHealthyEndpoint(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "NoHealthyEndpoint")
                }
                ConsensusError::InvalidAddress(_)
                | ConsensusError::InvalidMessage(_)
                | ConsensusError::InvalidConfig(_) => {
                    (StatusCode::BAD_REQUEST, "InvalidRequest")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
            },
            ApiError::NoSuchKey(_) => (StatusCode::NOT_FOUND, "NoSuchKey"),
            ApiError::NoSuchService(_) => (StatusCode::NOT_FOUND, "NoSuchService"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        }

        let body = serde_json::json!({
            "error": code,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
