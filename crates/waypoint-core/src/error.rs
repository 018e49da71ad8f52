//! Error taxonomy for the Waypoint orchestrator.
//!
//! Each component carries its own error enum; `EngineError` is the
//! umbrella type the engine and the HTTP adapter work with. When the
//! `axum` feature is enabled, `EngineError` also implements
//! `IntoResponse` so it can be used directly as an axum handler error
//! type.

use std::path::PathBuf;

/// Errors produced by the workflow definition service.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow definition not found: {message}")]
    NotFound {
        message: String,
        file: Option<PathBuf>,
    },

    #[error("workflow definition parse error: {message}")]
    Parsing {
        message: String,
        file: Option<PathBuf>,
    },
}

impl DefinitionError {
    pub fn not_found(message: impl Into<String>, file: Option<PathBuf>) -> Self {
        Self::NotFound {
            message: message.into(),
            file,
        }
    }

    pub fn parsing(message: impl Into<String>, file: Option<PathBuf>) -> Self {
        Self::Parsing {
            message: message.into(),
            file,
        }
    }
}

/// Errors produced by the persistence repository.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("database connection error: {0}")]
    Connection(String),

    #[error("database query error: {0}")]
    Query(String),
}

/// Errors produced by the AI client.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("AI service request timed out")]
    Timeout,

    #[error("AI service returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("AI service returned an invalid response: {message}")]
    InvalidResponse {
        message: String,
        raw: Option<String>,
    },

    #[error("AI request blocked by safety filters: {reason}")]
    Safety { reason: String },
}

impl AiError {
    pub fn invalid_response(message: impl Into<String>, raw: Option<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
            raw,
        }
    }

    /// Whether the wire-level retry policy applies: timeouts and 5xx
    /// API errors get one immediate retry, everything else does not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Api { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}

/// Errors produced while reading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {message}")]
    InvalidVar { var: &'static str, message: String },
}

/// Top-level error type for engine transitions and the tool surface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Ai(#[from] AiError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            EngineError::Definition(DefinitionError::NotFound { .. }) => StatusCode::NOT_FOUND,
            EngineError::Definition(DefinitionError::Parsing { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::Persistence(PersistenceError::InstanceNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            EngineError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Ai(_) => StatusCode::BAD_GATEWAY,
            EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
