//! Error types shared across the service.
//!
//! Two layers exist. [`FsError`] and [`StoreError`] describe what actually
//! went wrong at the OS or file level; [`ServiceError`] is the classified
//! form handed to the API layer, which maps it onto an HTTP status.

use std::path::PathBuf;

use axum::http::StatusCode;

/// Low-level failure raised by filesystem operations and external commands.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path is not writable: {}", path.display())]
    NotWritable { path: PathBuf },

    #[error("command `{command}` exited with {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("command `{command}` timed out after {secs}s")]
    CommandTimeout { command: String, secs: u64 },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ISO path should end with .iso: {input}")]
    InvalidIsoName { input: String },
}

impl FsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("inventory file not found: {}", path.display())]
    Missing { path: PathBuf },

    #[error("inventory io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inventory file {} is malformed: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Classified error returned by the inventory and catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ServiceError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ServiceError::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::BadRequest(m) | ServiceError::NotFound(m) | ServiceError::Internal(m) => m,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        tracing::error!("inventory store failure: {e}");
        ServiceError::Internal("Inventory store failure".to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
