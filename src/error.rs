//! Unified error types for pcmtrack

use thiserror::Error;

/// Main error type for PCM stream operations
#[derive(Error, Debug)]
pub enum PcmError {
    /// Slot already occupied, session unavailable, or allocation failure
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Operation attempted from a state that forbids it
    #[error("Invalid state for {operation}: stream is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// External audio-service call returned an error
    #[error("Session '{link}' failed during {operation}: {message}")]
    SessionFailure {
        link: String,
        operation: &'static str,
        message: String,
    },

    /// Requested parameters violate hardware constraints
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Caller abandoned the operation while waiting for the chip lock
    #[error("Interrupted while waiting for chip lock")]
    Interrupted,

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type alias for pcmtrack operations
pub type Result<T> = std::result::Result<T, PcmError>;

impl PcmError {
    /// Create a session failure with context
    pub fn session(
        link: impl Into<String>,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::SessionFailure {
            link: link.into(),
            operation,
            message: message.into(),
        }
    }

    /// Create an invalid-state error for the given operation
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Check if this error is recoverable (the operation can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PcmError::SessionFailure { .. }
                | PcmError::Interrupted
                | PcmError::ResourceUnavailable(_)
        )
    }
}
