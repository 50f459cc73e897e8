//! Error taxonomy for the sync engine
//!
//! `Timeout` carries a fixed message so downstream consumers can match on it
//! reliably. Fee indeterminacy is not an error and never appears here; it is
//! modelled as a nullable result in the ledger module.

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("indexing server not configured")]
    NotConfigured,

    #[error("connection error: {0}")]
    Connectivity(String),

    #[error("electrum request timed out")]
    Timeout,

    #[error("failed to sync with electrum server: {0}")]
    Sync(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("wallet storage error: {0}")]
    Storage(#[source] anyhow::Error),
}
