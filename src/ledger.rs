//! Ledger reconstruction
//!
//! Pure functions over wallet-owned data: per-transaction net value, fee,
//! confirmation count and a cumulative balance history. No network access;
//! the tip height is whatever advisory value the caller has.
//!
//! Fees are nullable rather than fallible: a referenced previous transaction
//! may legitimately not be known locally yet during an ongoing sync, and one
//! unknown fee must not fail the whole summary.

use bdk_wallet::bitcoin::{OutPoint, Txid};

use crate::wallet::{Wallet, WalletTransaction};

/// Derived per-transaction view; computed on demand, never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub txid: Txid,
    /// Net effect on the wallet in satoshis
    pub value: i64,
    /// None when indeterminate (previous output unknown locally)
    pub fee: Option<i64>,
    pub confirmations: u32,
    pub height: i32,
    pub timestamp: Option<u64>,
    pub label: Option<String>,
}

/// One point of the cumulative balance history, per confirmed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancePoint {
    pub timestamp: u64,
    pub balance: i64,
}

/// Confirmation count for a transaction height given the advisory tip.
/// Unconfirmed transactions (height <= 0) always report zero.
pub fn confirmations(height: i32, tip: Option<u32>) -> u32 {
    let Some(tip) = tip else { return 0 };
    if height <= 0 {
        return 0;
    }
    (i64::from(tip) - i64::from(height) + 1).max(0) as u32
}

/// Build summaries for every wallet transaction, ordered with unconfirmed
/// activity first, then most recent confirmed first.
pub fn transaction_summaries(wallet: &Wallet, tip: Option<u32>) -> Vec<TransactionSummary> {
    let mut summaries: Vec<TransactionSummary> = wallet
        .transactions()
        .map(|tx| {
            let incoming: i64 = wallet
                .owned_outputs()
                .filter(|o| o.outpoint.txid == tx.txid)
                .map(|o| o.value.to_sat() as i64)
                .sum();
            let outgoing: i64 = wallet
                .owned_outputs()
                .filter(|o| o.spent_by == Some(tx.txid))
                .map(|o| o.value.to_sat() as i64)
                .sum();
            TransactionSummary {
                txid: tx.txid,
                value: incoming - outgoing,
                fee: transaction_fee(wallet, tx),
                confirmations: confirmations(tx.height, tip),
                height: tx.height,
                timestamp: tx.timestamp,
                label: tx.label.clone(),
            }
        })
        .collect();

    summaries.sort_by(|a, b| {
        let unconfirmed = |s: &TransactionSummary| s.height <= 0;
        unconfirmed(b)
            .cmp(&unconfirmed(a))
            .then(b.height.cmp(&a.height))
            .then(b.timestamp.unwrap_or(0).cmp(&a.timestamp.unwrap_or(0)))
    });
    summaries
}

/// Fee paid by a transaction, walking every input's previous output.
///
/// A coinbase input forces the fee to exactly zero. A previous transaction
/// missing from the wallet's set, or a referenced output index out of range,
/// makes the fee indeterminate — both cases deliberately collapse to `None`.
pub fn transaction_fee(wallet: &Wallet, tx: &WalletTransaction) -> Option<i64> {
    let mut fee: i64 = 0;
    for input in &tx.tx.input {
        if input.previous_output == OutPoint::null() {
            return Some(0);
        }
        let prev = wallet.transaction(&input.previous_output.txid)?;
        let prev_out = prev.tx.output.get(input.previous_output.vout as usize)?;
        fee += prev_out.value.to_sat() as i64;
    }
    for output in &tx.tx.output {
        fee -= output.value.to_sat() as i64;
    }
    Some(fee)
}

/// Replay confirmed transactions in height order, emitting a running balance
/// per transaction.
///
/// Forward replay assumes the transaction set is complete up to the point
/// being replayed; a partial sync window under-reports early balance. That is
/// a known limitation, not something to paper over.
pub fn balance_history(summaries: &[TransactionSummary]) -> Vec<BalancePoint> {
    let mut confirmed: Vec<&TransactionSummary> = summaries
        .iter()
        .filter(|s| s.height > 0 && s.timestamp.is_some())
        .collect();
    confirmed.sort_by_key(|s| s.height);

    let mut running = 0i64;
    let mut points = Vec::with_capacity(confirmed.len());
    for summary in confirmed {
        running += summary.value;
        if let Some(timestamp) = summary.timestamp {
            points.push(BalancePoint {
                timestamp,
                balance: running,
            });
        }
    }
    points
}

/// Sum of all currently-unspent owned outputs, in satoshis. Independent of
/// the summary path; agrees with the final balance-history point once the
/// ledger is fully synced.
pub fn current_balance(wallet: &Wallet) -> u64 {
    wallet.unspent().map(|o| o.value.to_sat()).sum()
}
