//! Error types for the pack cache
//!
//! Every variant is cheap to clone so that one failed backend read can be
//! handed to every caller that joined the same in-flight load.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading through the pack cache
#[derive(Error, Debug, Clone)]
pub enum Error {
    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Transport or storage failure while reading a range of a pack file
    #[error("Backend I/O error reading {pack} [{offset}, +{length}): {reason}")]
    BackendIo {
        pack: String,
        offset: u64,
        length: u64,
        reason: String,
    },

    /// The backend has no such pack file
    #[error("Pack file not found: {pack} ({ext})")]
    PackNotFound { pack: String, ext: String },

    /// Requested range does not fit the pack or the block
    #[error("Range [{offset}, +{length}) is out of range for {pack} (size {size})")]
    OutOfRange {
        pack: String,
        offset: u64,
        length: u64,
        size: u64,
    },

    /// The task performing a shared load went away before publishing a result
    #[error("Shared load aborted: {0}")]
    LoadAborted(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Checksum or format violation while decompressing a cached block
    #[error("Data integrity failure in {pack} block {block}: {reason}")]
    DataIntegrity {
        pack: String,
        block: u64,
        reason: String,
    },

    /// A pack index or bitmap index could not be parsed
    #[error("Corrupt index for {pack}: {reason}")]
    CorruptIndex { pack: String, reason: String },

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came from the storage backend
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Error::BackendIo { .. } | Error::Io(_) | Error::Http(_) | Error::LoadAborted(_)
        )
    }

    /// Whether this error reports corrupt pack content
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::DataIntegrity { .. } | Error::CorruptIndex { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(Arc::new(err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_clone() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(copy.is_backend());
    }

    #[test]
    fn test_error_classification() {
        let integrity = Error::DataIntegrity {
            pack: "store/pack-1".into(),
            block: 3,
            reason: "hash mismatch".into(),
        };
        assert!(integrity.is_integrity());
        assert!(!integrity.is_backend());

        let backend = Error::BackendIo {
            pack: "store/pack-1".into(),
            offset: 0,
            length: 4096,
            reason: "connection reset".into(),
        };
        assert!(backend.is_backend());
        assert_eq!(
            backend.to_string(),
            "Backend I/O error reading store/pack-1 [0, +4096): connection reset"
        );
    }
}
