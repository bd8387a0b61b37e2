//! Error types for vaultcore

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vaultcore
#[derive(Error, Debug)]
pub enum Error {
    // Lookup and policy errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // Storage errors
    #[error("Storage unavailable at {path:?}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // Crypto errors
    #[error("Cipher I/O error: {0}")]
    CipherIo(String),

    #[error("Entropy source failure: {0}")]
    Entropy(String),

    // Export errors
    #[error("Archive error: {0}")]
    Archive(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification an API layer maps onto its own status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    StorageUnavailable,
    CipherIo,
    Validation,
    Internal,
}

impl ErrorKind {
    /// Conventional HTTP status for this kind
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Forbidden => 403,
            ErrorKind::Validation => 400,
            ErrorKind::StorageUnavailable => 503,
            ErrorKind::CipherIo | ErrorKind::Internal => 500,
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Validation(_) | Error::InvalidConfig(_) => ErrorKind::Validation,
            Error::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            Error::CipherIo(_) => ErrorKind::CipherIo,
            Error::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::StorageUnavailable {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Archive(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Forbidden("x".into()).kind(), ErrorKind::Forbidden);
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::CipherIo("x".into()).kind(), ErrorKind::CipherIo);
        assert_eq!(
            Error::storage("/nope", io::Error::from(io::ErrorKind::PermissionDenied)).kind(),
            ErrorKind::StorageUnavailable
        );
        assert_eq!(Error::Store("down".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Forbidden.http_status(), 403);
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::StorageUnavailable.http_status(), 503);
        assert_eq!(ErrorKind::CipherIo.http_status(), 500);
    }

    #[test]
    fn test_io_not_found_classifies_as_not_found() {
        let err: Error = io::Error::from(io::ErrorKind::NotFound).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
