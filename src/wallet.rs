//! Wallet-owned data model
//!
//! The derivation nodes, owned outputs and transaction set the sync engine
//! reads and the indexer gateway reconciles against. Key material here is
//! public-only; signing and encryption-at-rest belong to external
//! collaborators.

use std::collections::BTreeMap;
use std::fmt;

use bdk_wallet::bitcoin::base58;
use bdk_wallet::bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bdk_wallet::bitcoin::key::CompressedPublicKey;
use bdk_wallet::bitcoin::secp256k1::{self, Secp256k1, Verification, XOnlyPublicKey};
use bdk_wallet::bitcoin::{
    Address, Amount, Network, OutPoint, PublicKey, ScriptBuf, Transaction, Txid,
};

use crate::error::SyncError;

/// Which derivation chain an address node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPurpose {
    Receive,
    Change,
}

impl KeyPurpose {
    pub fn chain(&self) -> u32 {
        match self {
            KeyPurpose::Receive => 0,
            KeyPurpose::Change => 1,
        }
    }
}

/// Supported single-signature script types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
    P2tr,
}

impl ScriptType {
    /// BIP-43 purpose index for this script type
    pub fn purpose_index(&self) -> u32 {
        match self {
            ScriptType::P2pkh => 44,
            ScriptType::P2shP2wpkh => 49,
            ScriptType::P2wpkh => 84,
            ScriptType::P2tr => 86,
        }
    }

    pub fn from_purpose_index(index: u32) -> Option<ScriptType> {
        match index {
            44 => Some(ScriptType::P2pkh),
            49 => Some(ScriptType::P2shP2wpkh),
            84 => Some(ScriptType::P2wpkh),
            86 => Some(ScriptType::P2tr),
            _ => None,
        }
    }

    /// Standard account-level derivation path for this script type
    pub fn default_derivation_path(&self, network: Network) -> DerivationPath {
        let coin = if network == Network::Bitcoin { 0 } else { 1 };
        DerivationPath::from(vec![
            ChildNumber::Hardened {
                index: self.purpose_index(),
            },
            ChildNumber::Hardened { index: coin },
            ChildNumber::Hardened { index: 0 },
        ])
    }

    /// Build the address for a derived public key under this script type
    pub fn address<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        key: secp256k1::PublicKey,
        network: Network,
    ) -> Address {
        match self {
            ScriptType::P2pkh => Address::p2pkh(PublicKey::new(key).pubkey_hash(), network),
            ScriptType::P2shP2wpkh => Address::p2shwpkh(&CompressedPublicKey(key), network),
            ScriptType::P2wpkh => Address::p2wpkh(&CompressedPublicKey(key), network),
            ScriptType::P2tr => Address::p2tr(secp, XOnlyPublicKey::from(key), None, network),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2shP2wpkh => "p2sh-p2wpkh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2tr => "p2tr",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ScriptType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, SyncError> {
        match s.to_lowercase().as_str() {
            "p2pkh" => Ok(ScriptType::P2pkh),
            "p2sh-p2wpkh" | "p2sh_p2wpkh" => Ok(ScriptType::P2shP2wpkh),
            "p2wpkh" => Ok(ScriptType::P2wpkh),
            "p2tr" => Ok(ScriptType::P2tr),
            _ => Err(SyncError::InvalidRequest(format!(
                "unsupported script type: {s}"
            ))),
        }
    }
}

/// Stable key for an address node within its wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub purpose: KeyPurpose,
    pub index: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.purpose.chain(), self.index)
    }
}

/// An address-derivation leaf; its script is the remote lookup key
#[derive(Debug, Clone)]
pub struct WalletNode {
    pub id: NodeId,
    pub label: Option<String>,
    pub address: String,
    pub script: ScriptBuf,
}

/// An output the wallet controls or once controlled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
    /// Transaction that spent this output, if any. When set, that transaction
    /// is expected to be in the wallet's transaction set; fee computation for
    /// it degrades to indeterminate when it is not.
    pub spent_by: Option<Txid>,
}

/// A transaction known to touch the wallet
#[derive(Debug, Clone)]
pub struct WalletTransaction {
    pub txid: Txid,
    pub tx: Transaction,
    /// Confirmation height; zero or negative means unconfirmed
    pub height: i32,
    /// Unix seconds, only meaningful once confirmed
    pub timestamp: Option<u64>,
    pub label: Option<String>,
}

impl WalletTransaction {
    pub fn new(tx: Transaction, height: i32, timestamp: Option<u64>) -> Self {
        Self {
            txid: tx.compute_txid(),
            tx,
            height,
            timestamp,
            label: None,
        }
    }
}

/// In-memory wallet state the engine syncs
#[derive(Debug, Clone)]
pub struct Wallet {
    pub name: String,
    pub network: Network,
    pub script_type: ScriptType,
    pub watch_only: bool,
    pub derivation_path: DerivationPath,
    /// Height recorded by the last successful refresh
    pub stored_block_height: Option<u32>,
    account_xpub: Option<Xpub>,
    nodes: BTreeMap<NodeId, WalletNode>,
    owned: BTreeMap<OutPoint, OwnedOutput>,
    transactions: BTreeMap<Txid, WalletTransaction>,
}

impl Wallet {
    pub fn new(name: impl Into<String>, network: Network, script_type: ScriptType) -> Self {
        Self {
            name: name.into(),
            network,
            script_type,
            watch_only: false,
            derivation_path: script_type.default_derivation_path(network),
            stored_block_height: None,
            account_xpub: None,
            nodes: BTreeMap::new(),
            owned: BTreeMap::new(),
            transactions: BTreeMap::new(),
        }
    }

    pub fn new_watch_only(
        name: impl Into<String>,
        network: Network,
        script_type: ScriptType,
        account_xpub: Xpub,
        derivation_path: DerivationPath,
    ) -> Self {
        let mut wallet = Self::new(name, network, script_type);
        wallet.watch_only = true;
        wallet.account_xpub = Some(account_xpub);
        wallet.derivation_path = derivation_path;
        wallet
    }

    // ----- address nodes -----

    pub fn nodes(&self) -> impl Iterator<Item = &WalletNode> {
        self.nodes.values()
    }

    pub fn node(&self, id: NodeId) -> Option<&WalletNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut WalletNode> {
        self.nodes.get_mut(&id)
    }

    /// Register an externally derived node (e.g. restored from storage)
    pub fn add_node(&mut self, node: WalletNode) {
        self.nodes.insert(node.id, node);
    }

    /// Derive the node at `purpose`/`index` from the account public key
    pub fn derive_node(&self, purpose: KeyPurpose, index: u32) -> Result<WalletNode, SyncError> {
        let xpub = self.account_xpub.as_ref().ok_or_else(|| {
            SyncError::InvalidRequest(format!("wallet '{}' has no account public key", self.name))
        })?;

        let secp = Secp256k1::verification_only();
        let path = [
            ChildNumber::Normal {
                index: purpose.chain(),
            },
            ChildNumber::Normal { index },
        ];
        let derived = xpub
            .derive_pub(&secp, &path)
            .map_err(|e| SyncError::InvalidRequest(format!("address derivation failed: {e}")))?;
        let address = self.script_type.address(&secp, derived.public_key, self.network);

        Ok(WalletNode {
            id: NodeId { purpose, index },
            label: None,
            address: address.to_string(),
            script: address.script_pubkey(),
        })
    }

    /// Derive and register the next unused node on the given chain
    pub fn fresh_node(
        &mut self,
        purpose: KeyPurpose,
        label: Option<&str>,
    ) -> Result<WalletNode, SyncError> {
        let index = self
            .nodes
            .keys()
            .filter(|id| id.purpose == purpose)
            .map(|id| id.index + 1)
            .max()
            .unwrap_or(0);
        let mut node = self.derive_node(purpose, index)?;
        if let Some(label) = label.map(str::trim).filter(|l| !l.is_empty()) {
            node.label = Some(label.to_string());
        }
        self.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    /// Fill both chains up to the given node counts so history lookups cover
    /// addresses the wallet has not handed out yet
    pub fn derive_lookahead(&mut self, receive: u32, change: u32) -> Result<(), SyncError> {
        for (purpose, count) in [(KeyPurpose::Receive, receive), (KeyPurpose::Change, change)] {
            for index in 0..count {
                let id = NodeId { purpose, index };
                if !self.nodes.contains_key(&id) {
                    let node = self.derive_node(purpose, index)?;
                    self.nodes.insert(id, node);
                }
            }
        }
        Ok(())
    }

    /// Render the full derivation path of a node, e.g. `m/84'/0'/0'/0/3`
    pub fn node_derivation_path(&self, id: NodeId) -> String {
        let mut path = String::from("m");
        for child in self.derivation_path.into_iter() {
            path.push('/');
            path.push_str(&child.to_string());
        }
        format!("{}/{}/{}", path, id.purpose.chain(), id.index)
    }

    // ----- transactions -----

    pub fn transactions(&self) -> impl Iterator<Item = &WalletTransaction> {
        self.transactions.values()
    }

    pub fn transaction(&self, txid: &Txid) -> Option<&WalletTransaction> {
        self.transactions.get(txid)
    }

    pub fn insert_transaction(&mut self, tx: WalletTransaction) {
        self.transactions.insert(tx.txid, tx);
    }

    pub fn set_transaction_height(&mut self, txid: &Txid, height: i32, timestamp: Option<u64>) {
        if let Some(tx) = self.transactions.get_mut(txid) {
            tx.height = height;
            tx.timestamp = timestamp;
        }
    }

    // ----- owned outputs -----

    pub fn owned_outputs(&self) -> impl Iterator<Item = &OwnedOutput> {
        self.owned.values()
    }

    pub fn unspent(&self) -> impl Iterator<Item = &OwnedOutput> {
        self.owned.values().filter(|o| o.spent_by.is_none())
    }

    pub fn add_owned_output(&mut self, outpoint: OutPoint, value: Amount) {
        self.owned.entry(outpoint).or_insert(OwnedOutput {
            outpoint,
            value,
            spent_by: None,
        });
    }

    pub fn mark_spent(&mut self, outpoint: OutPoint, spent_by: Txid) {
        if let Some(output) = self.owned.get_mut(&outpoint) {
            output.spent_by = Some(spent_by);
        }
    }
}

/// Opaque persistence collaborator. The engine calls `update` after every
/// successful refresh and after any mutation; it does not define the file
/// format.
pub trait WalletStore: Send + Sync {
    fn load(&self, name: &str, credential: &str) -> anyhow::Result<Option<Wallet>>;
    fn save(&self, wallet: &Wallet) -> anyhow::Result<()>;
    fn update(&self, wallet: &Wallet) -> anyhow::Result<()>;
}

// ----- extended public key parsing -----

const VERSION_XPUB: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];
const VERSION_YPUB: [u8; 4] = [0x04, 0x9D, 0x7C, 0xB2];
const VERSION_ZPUB: [u8; 4] = [0x04, 0xB2, 0x47, 0x46];
const VERSION_TPUB: [u8; 4] = [0x04, 0x35, 0x87, 0xCF];
const VERSION_UPUB: [u8; 4] = [0x04, 0x4A, 0x52, 0x62];
const VERSION_VPUB: [u8; 4] = [0x04, 0x5F, 0x1C, 0xF6];

/// An extended public key with the script type its version bytes imply
#[derive(Debug, Clone)]
pub struct ParsedXpub {
    pub xpub: Xpub,
    pub header_script_type: Option<ScriptType>,
    pub mainnet: bool,
}

/// Parse an extended public key in any of the common version-byte dialects
/// (xpub/ypub/zpub and their testnet counterparts), normalizing to the
/// standard encoding while remembering what the header implied.
pub fn parse_extended_public_key(s: &str) -> Result<ParsedXpub, SyncError> {
    let mut data = base58::decode_check(s.trim())
        .map_err(|e| SyncError::InvalidRequest(format!("invalid extended public key: {e}")))?;
    if data.len() != 78 {
        return Err(SyncError::InvalidRequest(
            "invalid extended public key length".to_string(),
        ));
    }

    let version = [data[0], data[1], data[2], data[3]];
    let (header_script_type, mainnet) = match version {
        VERSION_XPUB => (Some(ScriptType::P2pkh), true),
        VERSION_YPUB => (Some(ScriptType::P2shP2wpkh), true),
        VERSION_ZPUB => (Some(ScriptType::P2wpkh), true),
        VERSION_TPUB => (Some(ScriptType::P2pkh), false),
        VERSION_UPUB => (Some(ScriptType::P2shP2wpkh), false),
        VERSION_VPUB => (Some(ScriptType::P2wpkh), false),
        _ => {
            return Err(SyncError::InvalidRequest(
                "unrecognised extended key version".to_string(),
            ))
        }
    };

    data[0..4].copy_from_slice(if mainnet { &VERSION_XPUB } else { &VERSION_TPUB });
    let xpub = Xpub::decode(&data)
        .map_err(|e| SyncError::InvalidRequest(format!("invalid extended public key: {e}")))?;

    Ok(ParsedXpub {
        xpub,
        header_script_type,
        mainnet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdk_wallet::bitcoin::bip32::Xpriv;

    fn test_xpub() -> Xpub {
        let secp = Secp256k1::new();
        let xprv = Xpriv::new_master(Network::Bitcoin, &[7u8; 32]).unwrap();
        Xpub::from_priv(&secp, &xprv)
    }

    fn reencode(xpub: &Xpub, version: [u8; 4]) -> String {
        let mut data = base58::decode_check(&xpub.to_string()).unwrap();
        data[0..4].copy_from_slice(&version);
        base58::encode_check(&data)
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_extended_public_key("not a key"),
            Err(SyncError::InvalidRequest(_))
        ));
        // valid base58check but not an extended key
        assert!(matches!(
            parse_extended_public_key("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
            Err(SyncError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_parse_header_script_types() {
        let xpub = test_xpub();

        let parsed = parse_extended_public_key(&xpub.to_string()).unwrap();
        assert_eq!(parsed.header_script_type, Some(ScriptType::P2pkh));
        assert!(parsed.mainnet);
        assert_eq!(parsed.xpub, xpub);

        let parsed = parse_extended_public_key(&reencode(&xpub, VERSION_YPUB)).unwrap();
        assert_eq!(parsed.header_script_type, Some(ScriptType::P2shP2wpkh));

        let parsed = parse_extended_public_key(&reencode(&xpub, VERSION_ZPUB)).unwrap();
        assert_eq!(parsed.header_script_type, Some(ScriptType::P2wpkh));
        assert_eq!(parsed.xpub, xpub);

        let parsed = parse_extended_public_key(&reencode(&xpub, VERSION_VPUB)).unwrap();
        assert_eq!(parsed.header_script_type, Some(ScriptType::P2wpkh));
        assert!(!parsed.mainnet);
    }

    #[test]
    fn test_default_derivation_paths() {
        let mainnet = ScriptType::P2wpkh.default_derivation_path(Network::Bitcoin);
        assert_eq!(mainnet.to_string().replace("m/", ""), "84'/0'/0'".to_string());

        let testnet = ScriptType::P2tr.default_derivation_path(Network::Testnet);
        assert_eq!(testnet.to_string().replace("m/", ""), "86'/1'/0'".to_string());
    }

    #[test]
    fn test_derive_node_per_script_type() {
        for script_type in [
            ScriptType::P2pkh,
            ScriptType::P2shP2wpkh,
            ScriptType::P2wpkh,
            ScriptType::P2tr,
        ] {
            let wallet = Wallet::new_watch_only(
                "w",
                Network::Bitcoin,
                script_type,
                test_xpub(),
                script_type.default_derivation_path(Network::Bitcoin),
            );
            let node = wallet.derive_node(KeyPurpose::Receive, 0).unwrap();
            assert!(!node.address.is_empty());
            assert!(!node.script.is_empty());
            // same node derives identically
            let again = wallet.derive_node(KeyPurpose::Receive, 0).unwrap();
            assert_eq!(node.script, again.script);
            // different chain derives differently
            let change = wallet.derive_node(KeyPurpose::Change, 0).unwrap();
            assert_ne!(node.script, change.script);
        }
    }

    #[test]
    fn test_fresh_node_advances_index() {
        let mut wallet = Wallet::new_watch_only(
            "w",
            Network::Bitcoin,
            ScriptType::P2wpkh,
            test_xpub(),
            ScriptType::P2wpkh.default_derivation_path(Network::Bitcoin),
        );
        let first = wallet.fresh_node(KeyPurpose::Receive, None).unwrap();
        let second = wallet.fresh_node(KeyPurpose::Receive, Some("rent")).unwrap();
        assert_eq!(first.id.index, 0);
        assert_eq!(second.id.index, 1);
        assert_eq!(second.label.as_deref(), Some("rent"));
        assert_eq!(
            wallet.node_derivation_path(second.id),
            "m/84'/0'/0'/0/1".to_string()
        );
    }

    #[test]
    fn test_derive_without_key_fails() {
        let wallet = Wallet::new("keyless", Network::Bitcoin, ScriptType::P2wpkh);
        assert!(matches!(
            wallet.derive_node(KeyPurpose::Receive, 0),
            Err(SyncError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_owned_output_bookkeeping() {
        use bdk_wallet::bitcoin::hashes::Hash;

        let mut wallet = Wallet::new("w", Network::Bitcoin, ScriptType::P2wpkh);
        let funding = Txid::from_byte_array([1u8; 32]);
        let spender = Txid::from_byte_array([2u8; 32]);
        let outpoint = OutPoint::new(funding, 0);

        wallet.add_owned_output(outpoint, Amount::from_sat(5000));
        assert_eq!(wallet.unspent().count(), 1);

        // re-adding must not clobber spend tracking
        wallet.mark_spent(outpoint, spender);
        wallet.add_owned_output(outpoint, Amount::from_sat(5000));
        assert_eq!(wallet.unspent().count(), 0);
        assert_eq!(
            wallet.owned_outputs().next().unwrap().spent_by,
            Some(spender)
        );
    }
}
