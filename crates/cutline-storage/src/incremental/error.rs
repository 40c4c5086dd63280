//! Error types for the shared state registry.

use cutline_core::error_codes;
use thiserror::Error;

use super::handle::SharedStateRegistryKey;

/// Errors that can occur while tracking shared state.
#[derive(Debug, Error)]
pub enum SharedStateError {
    /// Unregister of a key that holds no references.
    #[error("[{code}] cannot unregister shared state {0}: not registered", code = error_codes::SHARED_STATE_NOT_REGISTERED)]
    NotRegistered(SharedStateRegistryKey),

    /// The registry was closed at task-manager teardown.
    #[error("[{code}] shared state registry is closed", code = error_codes::REGISTRY_CLOSED)]
    RegistryClosed,

    /// I/O error while discarding state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SharedStateError {
    /// Returns true if the caller broke the registry protocol.
    ///
    /// These indicate a bookkeeping bug upstream and should fail the
    /// checkpoint rather than be retried.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::NotRegistered(_) | Self::RegistryClosed)
    }

    /// Returns true if this error indicates a transient failure that may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
