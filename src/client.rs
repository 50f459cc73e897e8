//! Connection lifecycle controller
//!
//! Owns the single physical connection to the indexing server and the one
//! background reader task attached to it. All state transitions (configure,
//! connect, reset) happen under a single lock; data fetches run after the
//! lock-protected connect step completes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, ServerEndpoint};
use crate::error::SyncError;
use crate::indexer::IndexerRpc;
use crate::timeouts;
use crate::wallet::Wallet;

/// Shared, advisory view of the last observed chain height. Zero means
/// unknown. Readers must treat the value as eventually consistent; it is a
/// last-known-good cache, never a consistency guarantee.
#[derive(Debug, Clone, Default)]
pub struct TipTracker(Arc<AtomicU32>);

impl TipTracker {
    pub fn get(&self) -> Option<u32> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            height => Some(height),
        }
    }

    pub fn set(&self, height: u32) {
        self.0.store(height, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    /// Only ever observed from within the locked connect sequence
    Connecting,
    Connected,
}

/// Options affecting deadline selection
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub use_proxy: bool,
    pub timeout_override: Option<Duration>,
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            use_proxy: config.use_proxy,
            timeout_override: config.timeout_override_secs.map(Duration::from_secs),
        }
    }
}

struct Inner {
    state: ConnectionState,
    reader: Option<JoinHandle<()>>,
    endpoint: Option<ServerEndpoint>,
    certificate: Option<PathBuf>,
}

/// Client for one remote indexing server
pub struct IndexerClient {
    rpc: Arc<dyn IndexerRpc>,
    inner: Mutex<Inner>,
    options: ClientOptions,
    tip: TipTracker,
}

impl IndexerClient {
    pub fn new(rpc: Arc<dyn IndexerRpc>, options: ClientOptions) -> Self {
        Self {
            rpc,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                reader: None,
                endpoint: None,
                certificate: None,
            }),
            options,
            tip: TipTracker::default(),
        }
    }

    /// Apply a new endpoint. Clears any prior trust certificate when none is
    /// supplied and unconditionally resets the current connection: a
    /// configuration change invalidates any live session.
    pub async fn configure(&self, endpoint: ServerEndpoint, certificate: Option<PathBuf>) {
        let mut inner = self.inner.lock().await;
        info!(
            host = %endpoint.host,
            port = ?endpoint.port,
            tls = endpoint.tls,
            use_proxy = self.options.use_proxy,
            "configuring indexing server"
        );
        inner.endpoint = Some(endpoint);
        inner.certificate = certificate;
        self.reset_locked(&mut inner).await;
    }

    /// Best-effort teardown. Close failures are swallowed — a dead connection
    /// cannot be cleanly closed and that is not itself an error.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.reset_locked(&mut inner).await;
    }

    async fn reset_locked(&self, inner: &mut Inner) {
        if self.rpc.is_connected().await {
            if let Err(e) = self.rpc.close().await {
                debug!("ignoring close failure during reset: {e}");
            }
        }
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        inner.state = ConnectionState::Disconnected;
    }

    /// Connect if not already connected. Idempotent under concurrent callers:
    /// one connect proceeds, the rest wait on the lock and observe the
    /// now-connected state. Connectivity errors propagate unchanged.
    pub async fn ensure_connected(&self) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        self.ensure_connected_locked(&mut inner).await
    }

    async fn ensure_connected_locked(&self, inner: &mut Inner) -> Result<(), SyncError> {
        if inner.state == ConnectionState::Connected && self.rpc.is_connected().await {
            return Ok(());
        }
        let endpoint = inner.endpoint.clone().ok_or(SyncError::NotConfigured)?;

        inner.state = ConnectionState::Connecting;
        info!(endpoint = %endpoint, "opening indexer connection");
        if let Err(e) = self
            .rpc
            .connect(&endpoint, inner.certificate.as_deref())
            .await
        {
            inner.state = ConnectionState::Disconnected;
            return Err(e);
        }

        let rpc = Arc::clone(&self.rpc);
        inner.reader = Some(tokio::spawn(async move {
            rpc.run_reader().await;
        }));
        inner.state = ConnectionState::Connected;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state == ConnectionState::Connected && self.rpc.is_connected().await
    }

    /// Last observed tip height, without a network round trip
    pub fn current_tip(&self) -> Option<u32> {
        self.tip.get()
    }

    /// Handle to the shared tip value for consumers that need to read it
    /// without holding the client
    pub fn tip_tracker(&self) -> TipTracker {
        self.tip.clone()
    }

    /// Subscribe to the remote tip and publish the observed height
    pub async fn fetch_tip(&self) -> Result<u32, SyncError> {
        self.ensure_connected().await?;
        self.subscribe_tip_inner().await
    }

    async fn subscribe_tip_inner(&self) -> Result<u32, SyncError> {
        let tip = self.rpc.subscribe_tip().await?;
        self.tip.set(tip.height);
        debug!(height = tip.height, "observed chain tip");
        Ok(tip.height)
    }

    async fn deadline(&self) -> Duration {
        let inner = self.inner.lock().await;
        timeouts::deadline_for(
            inner.endpoint.as_ref(),
            self.options.use_proxy,
            self.options.timeout_override,
        )
    }

    /// Health check: connect if needed, ping, and report the server version.
    /// The tip fetch afterwards is best-effort; its failure is logged, not
    /// raised.
    pub async fn ping(&self) -> Result<Vec<String>, SyncError> {
        let deadline = self.deadline().await;
        let result = timeouts::run_with_deadline(deadline, async {
            self.ensure_connected().await?;
            self.rpc.ping().await?;
            let version = self.rpc.server_version().await?;
            if let Err(e) = self.subscribe_tip_inner().await {
                warn!("tip height fetch failed after ping: {e}");
            }
            Ok(version)
        })
        .await;

        if matches!(result, Err(SyncError::Timeout)) {
            self.reset().await;
        }
        result
    }

    /// Refresh a wallet against the remote server under the configured
    /// deadline. The sequence is strict: tip, history, referenced
    /// transactions, reconciliation — each step depends on the previous one.
    /// On deadline expiry the in-flight operation is abandoned and the
    /// connection reset rather than trusted to resume cleanly.
    pub async fn refresh_wallet(&self, wallet: &mut Wallet) -> Result<u32, SyncError> {
        let deadline = self.deadline().await;
        let result = timeouts::run_with_deadline(deadline, async {
            self.ensure_connected().await?;
            let tip = self.subscribe_tip_inner().await?;
            info!(wallet = %wallet.name, "fetching script history");
            let history = self.rpc.fetch_history(wallet).await?;
            self.rpc
                .fetch_referenced_transactions(wallet, &history)
                .await?;
            self.rpc.reconcile_node_history(wallet, &history).await?;
            wallet.stored_block_height = Some(tip);
            info!(wallet = %wallet.name, tip, "refresh complete");
            Ok(tip)
        })
        .await;

        if matches!(result, Err(SyncError::Timeout)) {
            self.reset().await;
        }
        result
    }
}
