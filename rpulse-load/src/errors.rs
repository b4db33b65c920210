use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// A `completed` event was requested for a job whose `in_progress` transition was never recorded
    #[error("Missing job state for job {job_id}: completed requested before in_progress was recorded")]
    MissingJobState { job_id: i64 },

    /// Configuration failed validation
    #[error("Config validation: {message}")]
    InvalidConfig { message: String },

    /// Payload or report could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client could not be constructed
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Receiver: missing or invalid signature
    #[error("{message}")]
    Unauthenticated { message: String },

    /// Receiver: request body could not be understood
    #[error("{message}")]
    BadRequest { message: String },

    /// Generic internal error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::BadRequest { .. } | Error::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            Error::MissingJobState { .. }
            | Error::Serialization(_)
            | Error::HttpClient(_)
            | Error::Internal { .. }
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a message safe to hand back to a webhook sender
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } | Error::BadRequest { message } => message.clone(),
            Error::InvalidConfig { .. } => self.to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Unauthenticated { .. } => {
                tracing::error!("Webhook validation failed: {}", self);
            }
            Error::BadRequest { .. } | Error::InvalidConfig { .. } => {
                tracing::warn!("Rejected webhook: {}", self);
            }
            _ => {
                tracing::error!("Internal receiver error: {:#}", self);
            }
        }

        (self.status_code(), Json(json!({ "error": self.user_message() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
