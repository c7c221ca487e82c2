//! Error types for txgate.

use thiserror::Error;

use crate::core::TransactionId;

/// Failures raised by the transaction boundary itself.
///
/// Business failures never appear here: the interceptor returns the caller's
/// own error value untouched. Call sites are generic over `E: From<TxError>`
/// so these variants can travel through the same error channel
/// (`anyhow::Error` qualifies out of the box).
#[derive(Debug, Error)]
pub enum TxError {
    /// Malformed configuration or pointcut rule. Raised at startup only.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The resource provider could not hand out a unit-of-work resource.
    ///
    /// The provider's error is kept as the source; callers that need it
    /// verbatim get it back through [`TxError::source_error`].
    #[error("failed to acquire resource: {0}")]
    ResourceAcquisition(#[source] anyhow::Error),

    /// The store refused to start a transaction.
    #[error("failed to begin transaction {tx_id}: {source}")]
    Begin {
        tx_id: TransactionId,
        #[source]
        source: anyhow::Error,
    },

    /// The store refused to commit. The transaction ends rolled back.
    #[error("commit failed for transaction {tx_id}: {source}")]
    Commit {
        tx_id: TransactionId,
        #[source]
        source: anyhow::Error,
    },
}

impl TxError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The store's or provider's own error, exactly as it was raised.
    pub fn source_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Config(_) => None,
            Self::ResourceAcquisition(source)
            | Self::Begin { source, .. }
            | Self::Commit { source, .. } => Some(source),
        }
    }
}


/// Result alias for operations that can only fail with [`TxError`].
pub type TxResult<T> = std::result::Result<T, TxError>;
