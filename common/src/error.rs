use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Missing tenant context")]
    TenantRequired,
    #[error("Tenant mismatch in {location}")]
    TenantMismatch { location: String },
    #[error("Tenant isolation breach: {0}")]
    TenantIsolation(String),
    #[error("Ingestion backpressure: {queue_depth}/{max_pending} pending")]
    Backpressure {
        queue_depth: usize,
        max_pending: usize,
        estimated_wait_seconds: u64,
    },
    #[error("Collection sealed: {0}")]
    CollectionSealed(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Model contract violation: {0}")]
    Contract(String),
    #[error("Transient transport error: {0}")]
    Transient(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Classify whether a failed operation is worth requeueing.
    ///
    /// Database and HTTP transport hiccups are retried by the worker; anything
    /// else is treated as a persistent failure and consumes the retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Reqwest(err) => err.is_timeout() || err.is_connect(),
            Self::Database(err) => {
                let message = err.to_string().to_ascii_lowercase();
                message.contains("timed out")
                    || message.contains("connection")
                    || message.contains("resource busy")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_variant_is_transient() {
        assert!(AppError::Transient("socket reset".into()).is_transient());
    }

    #[test]
    fn validation_is_not_transient() {
        assert!(!AppError::Validation("bad filter".into()).is_transient());
        assert!(!AppError::NotFound("doc".into()).is_transient());
        assert!(!AppError::Contract("schema drift".into()).is_transient());
    }
}
