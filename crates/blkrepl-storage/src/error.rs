//! Error types for the storage subsystem.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Growing the bitmap could not allocate the page table.
    #[error("Out of memory: could not allocate {requested_pages} bitmap pages")]
    OutOfMemory {
        /// Number of additional pages that were requested.
        requested_pages: usize,
    },

    /// A bit or sector lies outside the current capacity.
    #[error("Out of range: {index} >= {limit}")]
    OutOfRange {
        /// The offending index.
        index: u64,
        /// The exclusive upper bound.
        limit: u64,
    },

    /// The on-disk metadata does not match the expected layout.
    #[error("Invalid metadata: {reason}")]
    MetadataInvalid {
        /// Description of the mismatch.
        reason: String,
    },

    /// Reading or writing metadata or the on-disk bitmap failed.
    #[error("Metadata I/O error: {msg}")]
    MetadataIo {
        /// Error message describing the failure.
        msg: String,
    },

    /// The backing device rejected a request flag it does not support.
    #[error("Unsupported: {msg}")]
    Unsupported {
        /// What was not supported.
        msg: String,
    },

    /// The backing device reported a failed read or write.
    #[error("Device error at sector {sector}: {reason}")]
    DeviceError {
        /// First sector of the failed request.
        sector: u64,
        /// Description of the error.
        reason: String,
    },

    /// A buffer did not have the length the operation requires.
    #[error("Bad buffer length: expected {expected}, got {actual}")]
    BadLength {
        /// Required length in bytes.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = StorageError::OutOfRange { index: 9, limit: 8 };
        assert_eq!(e.to_string(), "Out of range: 9 >= 8");

        let e = StorageError::MetadataInvalid {
            reason: "magic not found".to_string(),
        };
        assert!(e.to_string().contains("magic not found"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e: StorageError = io.into();
        assert!(matches!(e, StorageError::IoError(_)));
    }
}
