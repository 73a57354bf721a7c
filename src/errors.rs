use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Pairing required for printer {serial}")]
    PairingRequired { serial: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Port pool exhausted ({start}-{end})")]
    PoolExhausted { start: u16, end: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Error taxonomy exposed to the UI layer and embedded web server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    TransportError,
    PairingRequired,
    Unsupported,
    PoolExhausted,
    NotFound,
    ValidationError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportError => "TransportError",
            ErrorKind::PairingRequired => "PairingRequired",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::PoolExhausted => "PoolExhausted",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Transport(_) | DaemonError::Io(_) | DaemonError::Http(_) => {
                ErrorKind::TransportError
            }
            DaemonError::PairingRequired { .. } => ErrorKind::PairingRequired,
            DaemonError::Unsupported(_) => ErrorKind::Unsupported,
            DaemonError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            DaemonError::NotFound(_) => ErrorKind::NotFound,
            DaemonError::Validation(_) => ErrorKind::ValidationError,
            DaemonError::Config(_)
            | DaemonError::Discovery(_)
            | DaemonError::Stream(_)
            | DaemonError::Json(_)
            | DaemonError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether this failure means the printer link itself is broken.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::TransportError
    }

    pub fn unsupported(operation: &str) -> Self {
        DaemonError::Unsupported(operation.to_string())
    }
}

/// Uniform result envelope returned across the public service boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> CommandResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn failure(err: &DaemonError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.kind().as_str().to_string()),
            message: Some(err.to_string()),
        }
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl<T> From<Result<T>> for CommandResponse<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => CommandResponse::ok(data),
            Err(e) => CommandResponse::failure(&e),
        }
    }
}
