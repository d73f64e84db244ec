use thiserror::Error;
use super::types::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("HTTP Request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Failed to create upload session: {0}")]
    SessionInit(#[source] Box<UploadError>),

    #[error("Failed to query upload status: {0}")]
    StatusProbe(#[source] Box<UploadError>),

    #[error("Failed to upload chunk at offset {offset}: {source}")]
    ChunkTransfer {
        offset: u64,
        #[source]
        source: Box<UploadError>,
    },

    #[error("Failed to complete upload: {0}")]
    Completion(#[source] Box<UploadError>),

    #[error("{0}")]
    GatewayUnavailable(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("File is empty")]
    EmptyFile,

    #[error("Unsupported attachment category: {0}")]
    InvalidCategory(String),

    #[error("Path uploads require the desktop shell")]
    PathUploadUnsupported,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Cannot {action} task {task_id} in state {status:?}")]
    InvalidState {
        task_id: TaskId,
        action: &'static str,
        status: TaskStatus,
    },

    #[error("Manager shut down")]
    ManagerShutdown,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl UploadError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// True when the error only means a cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::SessionInit(inner)
            | Self::StatusProbe(inner)
            | Self::Completion(inner)
            | Self::ChunkTransfer { source: inner, .. } => inner.is_cancelled(),
            _ => false,
        }
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
