//! Error types for the replication subsystem.

use blkrepl_storage::StorageError;
use thiserror::Error;

use crate::state::SetStateCode;

/// Result type alias for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Stable result codes returned to administrative callers.
///
/// State-change rejections use the negative [`SetStateCode`] values; all
/// other administrative failures use one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RetCode {
    /// Operation succeeded.
    NoError = 101,
    /// The backing device is smaller than required.
    DeviceTooSmall = 111,
    /// Meta data and data overlap or the layout is unusable.
    MdLayoutInvalid = 116,
    /// Meta data I/O failed.
    MdIoError = 118,
    /// Meta data contents are invalid.
    MdInvalid = 119,
    /// Authentication algorithm not available.
    CramAlgNotAvail = 120,
    /// Out of memory.
    OutOfMemory = 122,
    /// Both nodes asked to lose data after split brain.
    DiscardNotAllowed = 123,
    /// A disk is already attached.
    HaveDiskConfig = 124,
    /// A network configuration already exists.
    HaveNetConfig = 125,
    /// Configuration values out of range.
    ConfigInvalid = 126,
    /// No such device.
    MinorNotKnown = 127,
    /// Operation not allowed in the current state.
    StateNotAllowed = 128,
    /// Resizing is not possible while resync runs.
    NoResizeDuringResync = 130,
    /// The resync-after target does not exist.
    SyncAfterInvalid = 132,
    /// The resync-after chain would contain a cycle.
    SyncAfterCycle = 133,
    /// Sync is already paused by the user.
    PauseFlagAlreadySet = 134,
    /// Sync is not paused by the user.
    PauseFlagAlreadyClear = 135,
    /// No disk is attached.
    HaveNoDiskConfig = 138,
    /// Online verify is already running.
    VerifyIsRunning = 148,
    /// Data does not belong to the expected generation.
    DataOfWrongCurrent = 149,
}

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A state change was rejected.
    #[error("state change refused: {}", .code.message())]
    StateRefused {
        /// The rejection code.
        code: SetStateCode,
    },

    /// An administrative request was refused.
    #[error("{msg} ({ret:?})")]
    Admin {
        /// Stable result code.
        ret: RetCode,
        /// Human readable reason.
        msg: String,
    },

    /// The peer violated the protocol.
    #[error("protocol error: {msg}")]
    Protocol {
        /// Error message describing the violation.
        msg: String,
    },

    /// Challenge/response authentication failed.
    #[error("authentication failed: {msg}")]
    Auth {
        /// Error message describing the failure.
        msg: String,
    },

    /// The peers' protocol version ranges do not overlap.
    #[error("incompatible protocol: we {own_min}-{own_max}, peer {peer_min}-{peer_max}")]
    IncompatibleVersion {
        /// Our minimum version.
        own_min: u32,
        /// Our maximum version.
        own_max: u32,
        /// Peer minimum version.
        peer_min: u32,
        /// Peer maximum version.
        peer_max: u32,
    },

    /// The peer connection is gone.
    #[error("disconnected: {msg}")]
    Disconnected {
        /// Error message describing the disconnect.
        msg: String,
    },

    /// Both nodes hold divergent data that could not be reconciled.
    #[error("split-brain detected: {msg}")]
    SplitBrain {
        /// Error message describing the decision.
        msg: String,
    },

    /// A request was failed because the connection was lost.
    #[error("connection lost before completion")]
    ConnectionLost,

    /// Configuration validation error.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the invalid value.
        msg: String,
    },

    /// An external helper failed to run.
    #[error("helper {name} failed: {msg}")]
    Helper {
        /// Helper command name.
        name: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// Waiting for a reply timed out.
    #[error("timed out waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
    },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device worker has shut down.
    #[error("device shut down")]
    Shutdown,
}

impl ReplError {
    /// Shorthand for an administrative refusal.
    pub fn admin(ret: RetCode, msg: impl Into<String>) -> Self {
        Self::Admin {
            ret,
            msg: msg.into(),
        }
    }

    /// Shorthand for a protocol violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol { msg: msg.into() }
    }

    /// Stable integer result code for administrative callers.
    pub fn code(&self) -> i32 {
        let ret = match self {
            ReplError::StateRefused { code } => return *code as i32,
            ReplError::Admin { ret, .. } => *ret,
            ReplError::Storage(StorageError::OutOfMemory { .. }) => RetCode::OutOfMemory,
            ReplError::Storage(StorageError::MetadataInvalid { .. }) => RetCode::MdInvalid,
            ReplError::Storage(_) | ReplError::Io(_) => RetCode::MdIoError,
            ReplError::Auth { .. } => RetCode::CramAlgNotAvail,
            ReplError::Config { .. } => RetCode::ConfigInvalid,
            ReplError::SplitBrain { .. } => RetCode::DiscardNotAllowed,
            ReplError::Protocol { .. }
            | ReplError::IncompatibleVersion { .. }
            | ReplError::Disconnected { .. }
            | ReplError::ConnectionLost
            | ReplError::Helper { .. }
            | ReplError::Timeout { .. }
            | ReplError::Shutdown => RetCode::StateNotAllowed,
        };
        ret as i32
    }

    /// True for rejections worth retrying after the next state change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplError::StateRefused {
                code: SetStateCode::InTransientState | SetStateCode::ConcurrentStChg
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_refused_code_and_message() {
        let e = ReplError::StateRefused {
            code: SetStateCode::TwoPrimaries,
        };
        assert_eq!(e.code(), -1);
        assert!(e.to_string().contains("Multiple primaries not allowed by config"));
    }

    #[test]
    fn test_admin_codes() {
        let e = ReplError::admin(RetCode::PauseFlagAlreadySet, "already paused");
        assert_eq!(e.code(), 134);
        assert!(e.to_string().contains("already paused"));
    }

    #[test]
    fn test_storage_codes() {
        let e: ReplError = StorageError::MetadataIo {
            msg: "boom".to_string(),
        }
        .into();
        assert_eq!(e.code(), RetCode::MdIoError as i32);
        let e: ReplError = StorageError::OutOfMemory { requested_pages: 3 }.into();
        assert_eq!(e.code(), RetCode::OutOfMemory as i32);
    }

    #[test]
    fn test_transient() {
        assert!(ReplError::StateRefused {
            code: SetStateCode::InTransientState
        }
        .is_transient());
        assert!(!ReplError::Shutdown.is_transient());
    }
}
