use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Every token failure collapses into this one variant.
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("history storage unavailable")]
    Storage(#[from] sqlx::Error),

    #[error("connection closed")]
    Closed,
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        use RelayError::*;
        match self {
            Unauthorized => "unauthorized",
            Validation(_) => "validation",
            NotFound(_) => "not-found",
            Storage(_) => "storage",
            Closed => "closed",
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("malformed command: {err}"))
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match self {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Closed => StatusCode::GONE,
        };

        (status, self.to_string()).into_response()
    }
}
