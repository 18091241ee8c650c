use crate::failure::ErrorContext;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SearchBindError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Timed out after {timeout_ms} ms waiting for index '{index}'; outcome unknown")]
    Timeout { index: String, timeout_ms: u64 },

    #[error("Batch failure on index '{}': {}", .0.index_name, .0.cause)]
    BatchFailure(Box<ErrorContext>),

    #[error("Routing resolution failed for {entity_type}#{id}: {reason}")]
    RoutingResolution {
        entity_type: String,
        id: String,
        reason: String,
    },

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Entity type not bound to any index: {0}")]
    UnknownEntityType(String),

    #[error("Work queue full for index '{index}' ({capacity} submissions pending)")]
    QueueFull { index: String, capacity: usize },

    #[error("Worker for index '{0}' has stopped")]
    WorkerStopped(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Tantivy error: {0}")]
    Tantivy(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, SearchBindError>;

impl From<std::io::Error> for SearchBindError {
    fn from(e: std::io::Error) -> Self {
        SearchBindError::Io(e.to_string())
    }
}

impl From<tantivy::TantivyError> for SearchBindError {
    fn from(e: tantivy::TantivyError) -> Self {
        SearchBindError::Tantivy(e.to_string())
    }
}

impl From<tantivy::directory::error::OpenDirectoryError> for SearchBindError {
    fn from(e: tantivy::directory::error::OpenDirectoryError) -> Self {
        SearchBindError::Tantivy(e.to_string())
    }
}

impl From<serde_json::Error> for SearchBindError {
    fn from(e: serde_json::Error) -> Self {
        SearchBindError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for SearchBindError {
    fn from(e: reqwest::Error) -> Self {
        SearchBindError::Http(e.to_string())
    }
}

impl SearchBindError {
    pub fn config(msg: impl Into<String>) -> Self {
        SearchBindError::Config(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        SearchBindError::IllegalState(msg.into())
    }

    /// Programming or configuration mistakes. These surface synchronously and
    /// are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SearchBindError::Config(_)
                | SearchBindError::IllegalState(_)
                | SearchBindError::UnknownEntityType(_)
        )
    }

    /// The backend may or may not have applied the work.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, SearchBindError::Timeout { .. })
    }

    pub fn error_context(&self) -> Option<&ErrorContext> {
        match self {
            SearchBindError::BatchFailure(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SearchBindError::Config(_) => "configuration_error",
            SearchBindError::IllegalState(_) => "illegal_state",
            SearchBindError::Timeout { .. } => "timeout",
            SearchBindError::BatchFailure(_) => "batch_failure",
            SearchBindError::RoutingResolution { .. } => "routing_resolution_error",
            SearchBindError::IndexNotFound(_) => "index_not_found",
            SearchBindError::IndexAlreadyExists(_) => "index_already_exists",
            SearchBindError::UnknownEntityType(_) => "unknown_entity_type",
            SearchBindError::QueueFull { .. } => "queue_full",
            SearchBindError::WorkerStopped(_) => "worker_stopped",
            SearchBindError::InvalidDocument(_) => "invalid_document",
            SearchBindError::Backend(_) => "backend_error",
            SearchBindError::Io(_) => "io_error",
            SearchBindError::Json(_) => "json_error",
            SearchBindError::Tantivy(_) => "tantivy_error",
            SearchBindError::Http(_) => "http_error",
        }
    }
}
