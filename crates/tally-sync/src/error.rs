//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Local         │  │     Remote              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Domain         │  │  Backend(Timeout)       │ │
//! │  │  MissingTermId  │  │  (CoreError)    │  │  Backend(Unavailable)   │ │
//! │  │  ConfigLoad/Save│  │  Storage        │  │  Backend(Rejected)      │ │
//! │  │                 │  │  (DbError)      │  │  Backend(Conflict)      │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │  Engine         │  │  Internal                                   │  │
//! │  │  Blocked        │  │  Internal / ShuttingDown / ChannelError     │  │
//! │  │  NotBlocked     │  │                                             │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use tally_core::CoreError;
use tally_db::DbError;

use crate::backend::BackendError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error("Terminal ID not configured")]
    MissingTerminalId,

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// The command is not valid against the current state.
    #[error(transparent)]
    Domain(#[from] CoreError),

    /// A durable write failed; nothing was applied.
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// The queue head is a blocking operation waiting for an operator.
    #[error("Operation {sequence_id} is blocked: {reason}")]
    Blocked { sequence_id: u64, reason: String },

    /// Operator action on an operation that is not at the blocked head.
    #[error("Operation {0} is not the blocked queue head")]
    NotBlocked(u64),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sync agent is shutting down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the same request may succeed later.
    ///
    /// ## Retryable Errors
    /// - Backend timeouts and unavailability
    /// - Local storage failures (the command was not applied)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Backend(err) => err.is_retryable(),
            SyncError::Storage(_) => true,
            _ => false,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingTerminalId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Backend(BackendError::Timeout).is_retryable());
        assert!(SyncError::Backend(BackendError::Unavailable("503".into())).is_retryable());
        assert!(SyncError::Storage(DbError::Internal("disk".into())).is_retryable());

        assert!(!SyncError::Backend(BackendError::Rejected("bad".into())).is_retryable());
        assert!(!SyncError::Domain(CoreError::EmptyCart).is_retryable());
        assert!(!SyncError::MissingTerminalId.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::InvalidConfig("x".into()).is_config_error());
        assert!(SyncError::Storage(DbError::PoolExhausted).is_storage_error());
        assert!(!SyncError::ShuttingDown.is_storage_error());
    }

    #[test]
    fn test_domain_error_display_is_transparent() {
        let err = SyncError::from(CoreError::NoActiveSession);
        assert_eq!(err.to_string(), CoreError::NoActiveSession.to_string());
    }
}
