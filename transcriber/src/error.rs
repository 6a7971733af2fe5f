use shared_protocol::RequestError;
use thiserror::Error;

/// Per-request failures. Every variant is reported to the client as
/// `{"error": <display>}` (or stored as a failed task) and never closes the
/// connection; socket errors are handled separately as `std::io::Error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Undecodable frame payload (bad UTF-8 or JSON).
    #[error("{0}")]
    Protocol(String),

    /// Missing or invalid request fields, unknown command.
    #[error("{0}")]
    Validation(String),

    /// Audio file missing, base64 or temp file failure.
    #[error("{0}")]
    Resource(String),

    /// Model load or inference failure.
    #[error("{0}")]
    Engine(String),
}

impl ServiceError {
    pub fn path_not_specified() -> Self {
        ServiceError::Validation("path not specified".to_string())
    }

    pub fn file_not_found(path: &str) -> Self {
        ServiceError::Resource(format!("file not found: {path}"))
    }

    pub fn audio_data(detail: impl std::fmt::Display) -> Self {
        ServiceError::Resource(format!("failed to process audio data: {detail}"))
    }
}

impl From<RequestError> for ServiceError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::InvalidJson(_) => ServiceError::Protocol(err.to_string()),
            _ => ServiceError::Validation(err.to_string()),
        }
    }
}
