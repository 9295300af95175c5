//! Typed domain errors (§7.1) plus the uniform API error envelope.
//!
//! `CoreError` is the `Result<T, E>` error type for every public pipeline
//! function. Each variant maps to a stable `code` string and a `category`
//! used both in structured logs and in the HTTP error envelope returned by
//! `server.rs`. CLI glue and tests convert via `anyhow::Error`'s blanket
//! `From` impl, pulled in transitively wherever `anyhow::Result` is used.

use serde::Serialize;
use thiserror::Error;

/// Step-local failure sub-kinds shared by partition/metadata/enrichment/chunking/embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Unreadable,
    NoContent,
    RateLimited,
    Timeout,
    DimensionMismatch,
    VendorError,
}

impl StepErrorKind {
    /// Whether a step boundary should retry this kind per §4.8's backoff policy.
    pub fn is_retryable(self) -> bool {
        matches!(self, StepErrorKind::RateLimited | StepErrorKind::Timeout)
    }
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepErrorKind::Unreadable => "unreadable",
            StepErrorKind::NoContent => "no_content",
            StepErrorKind::RateLimited => "rate_limited",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::DimensionMismatch => "dimension_mismatch",
            StepErrorKind::VendorError => "vendor_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication required")]
    Authentication,

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("partition step failed ({kind}): {message}")]
    Partition { kind: StepErrorKind, message: String },

    #[error("metadata step failed ({kind}): {message}")]
    Metadata { kind: StepErrorKind, message: String },

    #[error("enrichment step failed ({kind}): {message}")]
    Enrichment { kind: StepErrorKind, message: String },

    #[error("chunking step failed ({kind}): {message}")]
    Chunking { kind: StepErrorKind, message: String },

    #[error("embedding step failed ({kind}): {message}")]
    Embedding { kind: StepErrorKind, message: String },

    #[error("retrieval error: {0}")]
    Retrieval(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("external API error ({service}): {message}")]
    ExternalApi { service: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code, distinct per variant (distinct per
    /// `(category, kind)` pair for step-local variants).
    pub fn code(&self) -> String {
        match self {
            CoreError::Validation(_) => "validation".to_string(),
            CoreError::Authentication => "authentication".to_string(),
            CoreError::Authorization(_) => "authorization".to_string(),
            CoreError::NotFound { .. } => "not_found".to_string(),
            CoreError::Conflict(_) => "conflict".to_string(),
            CoreError::Config(_) => "config".to_string(),
            CoreError::Partition { kind, .. } => format!("partition.{kind}"),
            CoreError::Metadata { kind, .. } => format!("metadata.{kind}"),
            CoreError::Enrichment { kind, .. } => format!("enrichment.{kind}"),
            CoreError::Chunking { kind, .. } => format!("chunking.{kind}"),
            CoreError::Embedding { kind, .. } => format!("embedding.{kind}"),
            CoreError::Retrieval(_) => "retrieval".to_string(),
            CoreError::Generation(_) => "generation".to_string(),
            CoreError::Storage(_) => "storage".to_string(),
            CoreError::Database(_) => "database".to_string(),
            CoreError::ExternalApi { .. } => "external_api".to_string(),
            CoreError::Internal(_) => "internal".to_string(),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::Authentication => "authentication",
            CoreError::Authorization(_) => "authorization",
            CoreError::NotFound { .. } => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Config(_) => "config",
            CoreError::Partition { .. } => "partition",
            CoreError::Metadata { .. } => "metadata",
            CoreError::Enrichment { .. } => "enrichment",
            CoreError::Chunking { .. } => "chunking",
            CoreError::Embedding { .. } => "embedding",
            CoreError::Retrieval(_) => "retrieval",
            CoreError::Generation(_) => "generation",
            CoreError::Storage(_) => "storage",
            CoreError::Database(_) => "database",
            CoreError::ExternalApi { .. } => "external_api",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Whether this error's sub-kind should be retried at the step boundary (§7.2).
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Partition { kind, .. }
            | CoreError::Metadata { kind, .. }
            | CoreError::Enrichment { kind, .. }
            | CoreError::Chunking { kind, .. }
            | CoreError::Embedding { kind, .. } => kind.is_retryable(),
            CoreError::ExternalApi { .. } => true,
            _ => false,
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

/// Uniform error envelope: `{code, message, details?, request_id, timestamp}` (§3.3).
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub request_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &CoreError, request_id: &str) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            details: None,
            request_id: request_id.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn http_status(category: &str) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match category {
            "validation" => StatusCode::BAD_REQUEST,
            "authentication" => StatusCode::UNAUTHORIZED,
            "authorization" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "config" => StatusCode::INTERNAL_SERVER_ERROR,
            "retrieval" | "generation" | "storage" | "database" | "external_api" => {
                StatusCode::BAD_GATEWAY
            }
            _ if category.starts_with("partition")
                || category.starts_with("metadata")
                || category.starts_with("enrichment")
                || category.starts_with("chunking")
                || category.starts_with("embedding") =>
            {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_kind_code_is_namespaced() {
        let err = CoreError::Embedding {
            kind: StepErrorKind::DimensionMismatch,
            message: "expected 1024".to_string(),
        };
        assert_eq!(err.code(), "embedding.dimension_mismatch");
        assert_eq!(err.category(), "embedding");
    }

    #[test]
    fn retryable_kinds() {
        assert!(StepErrorKind::RateLimited.is_retryable());
        assert!(StepErrorKind::Timeout.is_retryable());
        assert!(!StepErrorKind::NoContent.is_retryable());
    }

    #[test]
    fn not_found_code() {
        let err = CoreError::not_found("document", "d1");
        assert_eq!(err.code(), "not_found");
    }
}
