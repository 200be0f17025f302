use axum::http::StatusCode;
use thiserror::Error;

/// Failures that carry a client-facing meaning. Everything else travels as a
/// plain `anyhow::Error` and surfaces as a 500.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("Agent with id {0} not found. Available agents: 1, 2, 3, 4")]
    UnknownStage(i64),
    #[error("{0}")]
    NotFound(String),
    #[error("LLM provider error: {0}")]
    Upstream(String),
    #[error("{0}")]
    Render(String),
    #[error("{0}")]
    Publish(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::UnknownStage(_) | Self::Render(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(_) | Self::Publish(_) => StatusCode::BAD_GATEWAY,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

/// Finds the first `PipelineError` in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}
