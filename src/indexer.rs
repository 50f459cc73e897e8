//! Remote indexer gateway
//!
//! Narrow capability set the engine needs from a blockchain-indexing server:
//! ping, tip subscription, per-script history, referenced-transaction fetch
//! and history reconciliation. Implementations own the wire protocol; the
//! engine never frames messages itself and never retries here — timeout and
//! retry policy belong to the connection controller.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use bdk_wallet::bitcoin::hashes::{sha256, Hash};
use bdk_wallet::bitcoin::{Script, Txid};

use crate::config::ServerEndpoint;
use crate::error::SyncError;
use crate::wallet::{NodeId, Wallet, WalletNode};

/// Most recently observed remote chain tip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u32,
}

/// One history item for a script: a transaction and the height it confirmed
/// at. Non-positive height means unconfirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HistoryEntry {
    pub height: i32,
    pub txid: Txid,
}

/// History returned by the server, one entry set per address node
pub type NodeHistory = BTreeMap<NodeId, BTreeSet<HistoryEntry>>;

/// Capability set of the remote indexing server.
///
/// `fetch_referenced_transactions` and `reconcile_node_history` mutate the
/// wallet collaborator's owned-output and transaction state as a side effect;
/// the gateway only drives the calls in order.
#[async_trait]
pub trait IndexerRpc: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// Open the single physical connection. The endpoint and trust
    /// certificate are passed explicitly on every connect.
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        certificate: Option<&Path>,
    ) -> Result<(), SyncError>;

    async fn close(&self) -> Result<(), SyncError>;

    /// Background read loop delivering asynchronous server notifications.
    /// Spawned and aborted only by the connection controller.
    async fn run_reader(&self);

    async fn ping(&self) -> Result<(), SyncError>;

    async fn server_version(&self) -> Result<Vec<String>, SyncError>;

    async fn subscribe_tip(&self) -> Result<ChainTip, SyncError>;

    /// Fetch history for every address node of the wallet
    async fn fetch_history(&self, wallet: &Wallet) -> Result<NodeHistory, SyncError>;

    /// Pull raw transactions referenced by the history that the wallet does
    /// not know yet, inserting them into the wallet's transaction set
    async fn fetch_referenced_transactions(
        &self,
        wallet: &mut Wallet,
        history: &NodeHistory,
    ) -> Result<(), SyncError>;

    /// Reconcile fetched history into the wallet's owned-output state
    async fn reconcile_node_history(
        &self,
        wallet: &mut Wallet,
        history: &NodeHistory,
    ) -> Result<(), SyncError>;

    /// Remote lookup key for an address node
    fn script_fingerprint(&self, node: &WalletNode) -> String {
        script_fingerprint(&node.script)
    }
}

/// Stable hash of a spending condition, used as the remote lookup key:
/// sha256 of the script bytes, reversed, hex-encoded.
pub fn script_fingerprint(script: &Script) -> String {
    let digest = sha256::Hash::hash(script.as_bytes());
    let mut bytes = digest.to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}
