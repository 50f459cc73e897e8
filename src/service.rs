//! Wallet orchestration
//!
//! Owns the registry of open wallets and drives refreshes through the
//! connection controller. Each wallet gets a handle with its own lock, so a
//! slow refresh of one wallet never blocks reads of another. Refreshes of the
//! same wallet serialize on a per-handle gate, and every caller runs its own
//! refresh and observes its real outcome.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use bdk_wallet::bitcoin::bip32::{ChildNumber, DerivationPath};
use bdk_wallet::bitcoin::Network;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::IndexerClient;
use crate::error::SyncError;
use crate::ledger::{self, BalancePoint, TransactionSummary};
use crate::wallet::{
    parse_extended_public_key, KeyPurpose, ScriptType, Wallet, WalletNode, WalletStore,
};

/// How far past the highest used index history lookups reach
pub const RECEIVE_LOOKAHEAD: u32 = 20;
pub const CHANGE_LOOKAHEAD: u32 = 10;

struct WalletHandle {
    wallet: Mutex<Wallet>,
    /// Single-flight gate; held for the duration of one refresh
    refresh_gate: Mutex<()>,
}

impl WalletHandle {
    fn new(wallet: Wallet) -> Arc<Self> {
        Arc::new(Self {
            wallet: Mutex::new(wallet),
            refresh_gate: Mutex::new(()),
        })
    }
}

/// Front door for wallet operations: open, refresh, derive addresses and
/// read ledger views
pub struct WalletService {
    client: Arc<IndexerClient>,
    store: Arc<dyn WalletStore>,
    wallets: Mutex<HashMap<String, Arc<WalletHandle>>>,
}

impl WalletService {
    pub fn new(client: Arc<IndexerClient>, store: Arc<dyn WalletStore>) -> Self {
        Self {
            client,
            store,
            wallets: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<IndexerClient> {
        &self.client
    }

    async fn handle(&self, name: &str) -> Result<Arc<WalletHandle>, SyncError> {
        let wallets = self.wallets.lock().await;
        wallets
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::WalletNotFound(name.to_string()))
    }

    pub async fn wallet_names(&self) -> Vec<String> {
        let wallets = self.wallets.lock().await;
        let mut names: Vec<String> = wallets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load a stored wallet into the registry and attempt an initial sync.
    /// Opening an already-open wallet is a no-op. The store is read outside
    /// the registry lock so one slow load never stalls other wallets.
    pub async fn open_wallet(&self, name: &str, credential: &str) -> Result<(), SyncError> {
        if self.wallets.lock().await.contains_key(name) {
            return Ok(());
        }
        let wallet = self
            .store
            .load(name, credential)
            .map_err(SyncError::Storage)?
            .ok_or_else(|| SyncError::WalletNotFound(name.to_string()))?;
        {
            let mut wallets = self.wallets.lock().await;
            // a concurrent open may have won the race; keep its handle
            if !wallets.contains_key(name) {
                info!(wallet = name, network = %wallet.network, "opened wallet");
                wallets.insert(name.to_string(), WalletHandle::new(wallet));
            }
        }
        self.refresh_best_effort(name).await;
        Ok(())
    }

    /// Create and register a watch-only wallet from an extended public key.
    ///
    /// The script type is resolved from, in order of trust: the caller's
    /// explicit request, the derivation path's purpose index, the key's
    /// version-byte header. When path and header disagree the path wins and
    /// the disagreement is logged.
    pub async fn create_watch_only(
        &self,
        name: &str,
        extended_key: &str,
        requested: Option<ScriptType>,
        derivation_path: Option<&str>,
        network: Network,
    ) -> Result<(), SyncError> {
        if self.wallets.lock().await.contains_key(name) {
            return Err(SyncError::InvalidRequest(format!(
                "wallet '{name}' already exists"
            )));
        }

        let parsed = parse_extended_public_key(extended_key)?;
        if parsed.mainnet != (network == Network::Bitcoin) {
            return Err(SyncError::InvalidRequest(format!(
                "extended key network does not match {network}"
            )));
        }

        let explicit_path = derivation_path
            .map(|p| {
                DerivationPath::from_str(p).map_err(|e| {
                    SyncError::InvalidRequest(format!("invalid derivation path '{p}': {e}"))
                })
            })
            .transpose()?;
        let path_implied = explicit_path
            .as_ref()
            .and_then(script_type_from_derivation_path);

        let resolution =
            resolve_watch_only_script_type(requested, path_implied, parsed.header_script_type);
        if resolution.mismatch {
            warn!(
                wallet = name,
                path = ?path_implied,
                header = ?parsed.header_script_type,
                "derivation path and key header imply different script types, using the path"
            );
        }
        let script_type = resolution.script_type;
        let path = explicit_path.unwrap_or_else(|| script_type.default_derivation_path(network));

        let mut wallet = Wallet::new_watch_only(name, network, script_type, parsed.xpub, path);
        wallet.derive_lookahead(RECEIVE_LOOKAHEAD, CHANGE_LOOKAHEAD)?;
        // derivation and the store write happen outside the registry lock
        self.store.save(&wallet).map_err(SyncError::Storage)?;
        {
            let mut wallets = self.wallets.lock().await;
            if wallets.contains_key(name) {
                return Err(SyncError::InvalidRequest(format!(
                    "wallet '{name}' already exists"
                )));
            }
            info!(wallet = name, %script_type, "created watch-only wallet");
            wallets.insert(name.to_string(), WalletHandle::new(wallet));
        }
        self.refresh_best_effort(name).await;
        Ok(())
    }

    /// Refresh one wallet against the indexing server.
    ///
    /// With `allow_partial_failure` any failure is logged and reported as
    /// `Ok(None)`, leaving the wallet's last-known state untouched, so that a
    /// background resync continues past one bad wallet. On the strict path a
    /// timeout keeps its fixed condition and any other failure is rewrapped
    /// with its underlying message.
    pub async fn refresh(
        &self,
        name: &str,
        allow_partial_failure: bool,
    ) -> Result<Option<u32>, SyncError> {
        let handle = self.handle(name).await?;

        // refreshes of the same wallet run one at a time
        let _gate = handle.refresh_gate.lock().await;
        let mut wallet = handle.wallet.lock().await;
        match self.client.refresh_wallet(&mut wallet).await {
            Ok(tip) => {
                self.store.update(&wallet).map_err(SyncError::Storage)?;
                Ok(Some(tip))
            }
            Err(e) if allow_partial_failure => {
                warn!(wallet = name, "refresh failed: {e}");
                Ok(None)
            }
            Err(e @ (SyncError::Timeout | SyncError::NotConfigured)) => Err(e),
            Err(e) => Err(SyncError::Sync(e.to_string())),
        }
    }

    async fn refresh_best_effort(&self, name: &str) {
        if let Err(e) = self.refresh(name, true).await {
            warn!(wallet = name, "serving stored ledger state: {e}");
        }
    }

    /// Advisory tip for ledger views: the live observed tip when available,
    /// else the height recorded at the wallet's last successful refresh
    fn view_tip(&self, wallet: &Wallet) -> Option<u32> {
        self.client.current_tip().or(wallet.stored_block_height)
    }

    /// Transaction summaries, freshest-first. Attempts a refresh first but
    /// serves stored state when the server is unreachable.
    pub async fn transactions(&self, name: &str) -> Result<Vec<TransactionSummary>, SyncError> {
        let handle = self.handle(name).await?;
        self.refresh_best_effort(name).await;
        let wallet = handle.wallet.lock().await;
        Ok(ledger::transaction_summaries(&wallet, self.view_tip(&wallet)))
    }

    /// Cumulative confirmed balance over time
    pub async fn balance_history(&self, name: &str) -> Result<Vec<BalancePoint>, SyncError> {
        let handle = self.handle(name).await?;
        self.refresh_best_effort(name).await;
        let wallet = handle.wallet.lock().await;
        let summaries = ledger::transaction_summaries(&wallet, self.view_tip(&wallet));
        Ok(ledger::balance_history(&summaries))
    }

    /// Spendable balance in satoshis, from stored state only
    pub async fn balance(&self, name: &str) -> Result<u64, SyncError> {
        let handle = self.handle(name).await?;
        let wallet = handle.wallet.lock().await;
        Ok(ledger::current_balance(&wallet))
    }

    /// Aggregate snapshot of one wallet: identity fields, spendable balance
    /// and the height of the last successful refresh. Attempts a refresh
    /// first but serves stored state when the server is unreachable.
    pub async fn summary(&self, name: &str) -> Result<WalletSummary, SyncError> {
        let handle = self.handle(name).await?;
        self.refresh_best_effort(name).await;
        let wallet = handle.wallet.lock().await;
        Ok(WalletSummary {
            name: wallet.name.clone(),
            network: wallet.network,
            script_type: wallet.script_type,
            watch_only: wallet.watch_only,
            balance: ledger::current_balance(&wallet),
            last_synced_height: wallet.stored_block_height,
        })
    }

    /// Hand out the next unused receive address and persist the advance
    pub async fn receive_address(
        &self,
        name: &str,
        label: Option<&str>,
    ) -> Result<WalletNode, SyncError> {
        let handle = self.handle(name).await?;
        let mut wallet = handle.wallet.lock().await;
        let node = wallet.fresh_node(KeyPurpose::Receive, label)?;
        self.store.update(&wallet).map_err(SyncError::Storage)?;
        info!(wallet = name, node = %node.id, "issued receive address");
        Ok(node)
    }
}

/// Aggregate view of one open wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSummary {
    pub name: String,
    pub network: Network,
    pub script_type: ScriptType,
    pub watch_only: bool,
    /// Sum of currently-unspent owned outputs, in satoshis
    pub balance: u64,
    /// Height recorded by the last successful refresh
    pub last_synced_height: Option<u32>,
}

/// Outcome of script-type resolution for a watch-only wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptTypeResolution {
    pub script_type: ScriptType,
    /// Path and header both implied a type and they disagreed
    pub mismatch: bool,
}

/// Pick the script type for a watch-only wallet. An explicit request always
/// wins; otherwise the derivation path's purpose index outranks the key
/// header, and a wallet with neither defaults to native segwit.
pub fn resolve_watch_only_script_type(
    requested: Option<ScriptType>,
    path_implied: Option<ScriptType>,
    header_implied: Option<ScriptType>,
) -> ScriptTypeResolution {
    if let Some(script_type) = requested {
        return ScriptTypeResolution {
            script_type,
            mismatch: false,
        };
    }
    let mismatch = matches!(
        (path_implied, header_implied),
        (Some(p), Some(h)) if p != h
    );
    ScriptTypeResolution {
        script_type: path_implied
            .or(header_implied)
            .unwrap_or(ScriptType::P2wpkh),
        mismatch,
    }
}

/// Script type implied by a derivation path's leading purpose index, when the
/// path starts with a recognised hardened purpose
pub fn script_type_from_derivation_path(path: &DerivationPath) -> Option<ScriptType> {
    match path.into_iter().next() {
        Some(ChildNumber::Hardened { index }) => ScriptType::from_purpose_index(*index),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> DerivationPath {
        DerivationPath::from_str(s).unwrap()
    }

    #[test]
    fn test_script_type_from_derivation_path() {
        assert_eq!(
            script_type_from_derivation_path(&path("m/44'/0'/0'")),
            Some(ScriptType::P2pkh)
        );
        assert_eq!(
            script_type_from_derivation_path(&path("m/49'/1'/0'")),
            Some(ScriptType::P2shP2wpkh)
        );
        assert_eq!(
            script_type_from_derivation_path(&path("m/84'/0'/0'")),
            Some(ScriptType::P2wpkh)
        );
        assert_eq!(
            script_type_from_derivation_path(&path("m/86'/0'/0'")),
            Some(ScriptType::P2tr)
        );
        // unknown purpose, or a non-hardened first step, implies nothing
        assert_eq!(script_type_from_derivation_path(&path("m/48'/0'/0'")), None);
        assert_eq!(script_type_from_derivation_path(&path("m/0/1")), None);
        assert_eq!(script_type_from_derivation_path(&path("m")), None);
    }

    #[test]
    fn test_explicit_request_always_wins() {
        let resolution = resolve_watch_only_script_type(
            Some(ScriptType::P2tr),
            Some(ScriptType::P2pkh),
            Some(ScriptType::P2wpkh),
        );
        assert_eq!(resolution.script_type, ScriptType::P2tr);
        assert!(!resolution.mismatch);
    }

    #[test]
    fn test_path_outranks_header_on_disagreement() {
        let resolution = resolve_watch_only_script_type(
            None,
            Some(ScriptType::P2wpkh),
            Some(ScriptType::P2pkh),
        );
        assert_eq!(resolution.script_type, ScriptType::P2wpkh);
        assert!(resolution.mismatch);
    }

    #[test]
    fn test_header_used_when_path_silent() {
        let resolution =
            resolve_watch_only_script_type(None, None, Some(ScriptType::P2shP2wpkh));
        assert_eq!(resolution.script_type, ScriptType::P2shP2wpkh);
        assert!(!resolution.mismatch);
    }

    #[test]
    fn test_agreement_is_not_a_mismatch() {
        let resolution = resolve_watch_only_script_type(
            None,
            Some(ScriptType::P2wpkh),
            Some(ScriptType::P2wpkh),
        );
        assert_eq!(resolution.script_type, ScriptType::P2wpkh);
        assert!(!resolution.mismatch);
    }

    #[test]
    fn test_default_is_native_segwit() {
        let resolution = resolve_watch_only_script_type(None, None, None);
        assert_eq!(resolution.script_type, ScriptType::P2wpkh);
        assert!(!resolution.mismatch);
    }
}
