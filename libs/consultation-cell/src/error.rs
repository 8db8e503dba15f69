use std::fmt::Display;

use thiserror::Error;

use shared_models::error::AppError;

#[derive(Error, Debug)]
pub enum ConsultationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity} status transition from {from} to {to}")]
    InvalidState { entity: &'static str, from: String, to: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConsultationError {
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        ConsultationError::NotFound { entity, id: id.to_string() }
    }

    pub fn invalid_state(entity: &'static str, from: impl Display, to: impl Display) -> Self {
        ConsultationError::InvalidState {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConsultationError::NotFound { .. })
    }

    /// Only persistence failures are worth retrying, and only for reads.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsultationError::Store(_))
    }
}

impl From<ConsultationError> for AppError {
    fn from(error: ConsultationError) -> Self {
        match error {
            ConsultationError::Validation(msg) => AppError::ValidationError(msg),
            ConsultationError::NotFound { .. } => AppError::NotFound(error.to_string()),
            ConsultationError::InvalidState { .. } => AppError::Conflict(error.to_string()),
            ConsultationError::Store(msg) => AppError::Database(msg),
            ConsultationError::Serialization(e) => AppError::Internal(e.to_string()),
        }
    }
}
