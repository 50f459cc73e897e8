// Library interface for the siskin sync engine
// Exposes the connection, ledger and orchestration modules

pub mod client;
pub mod config;
pub mod error;
pub mod indexer;
pub mod ledger;
pub mod service;
pub mod timeouts;
pub mod wallet;

pub use client::{ClientOptions, IndexerClient, TipTracker};
pub use error::SyncError;
pub use service::{WalletService, WalletSummary};
