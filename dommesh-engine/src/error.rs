//! Error types for the domain reconciliation engine.

use thiserror::Error;

/// Errors that can occur while reconciling or converging a domain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The host could not be reached by a collaborator.
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    /// The domain is not known to the host.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// The command facade declined a lifecycle command.
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Defining or modifying a domain definition failed.
    #[error("Failed to define domain: {0}")]
    DefineFailed(String),

    /// Removing a domain definition failed.
    #[error("Failed to undefine domain: {0}")]
    UndefineFailed(String),

    /// No hardware item exists under the given key.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A hardware or domain parameter failed validation.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation is not allowed in the current local state.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DomainError>;

impl DomainError {
    /// Error returned when a lock guarding shared state was poisoned.
    pub(crate) fn poisoned(what: &str) -> Self {
        DomainError::Internal(format!("{} lock poisoned", what))
    }
}
