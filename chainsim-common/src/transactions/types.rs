use serde::{Deserialize, Serialize};

use crate::crypto::{digest, signing};

/// A signed transfer intent.
///
/// Immutable once created: `id` covers `(from, to, amount, nonce, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub nonce: u64,
    pub timestamp: u64,
    pub signature: String,
}

#[derive(Serialize)]
struct TransactionIdView<'a> {
    from: &'a str,
    to: &'a str,
    amount: u64,
    nonce: u64,
    timestamp: u64,
}

pub fn compute_tx_id(from: &str, to: &str, amount: u64, nonce: u64, timestamp: u64) -> String {
    let bytes = bincode::serialize(&TransactionIdView { from, to, amount, nonce, timestamp })
        .unwrap_or_default();
    digest(&bytes)
}

impl Transaction {
    /// Builds an unsigned transaction.
    pub fn new(from: &str, to: &str, amount: u64, nonce: u64, timestamp: u64) -> Self {
        Self {
            id: compute_tx_id(from, to, amount, nonce, timestamp),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            nonce,
            timestamp,
            signature: String::new(),
        }
    }

    /// Builds a transaction signed by its sender.
    pub fn signed(from: &str, to: &str, amount: u64, nonce: u64, timestamp: u64) -> Self {
        let mut tx = Self::new(from, to, amount, nonce, timestamp);
        tx.signature = signing::sign(&tx.from, &tx.id);
        tx
    }

    pub fn expected_id(&self) -> String {
        compute_tx_id(&self.from, &self.to, self.amount, self.nonce, self.timestamp)
    }

    pub fn has_valid_signature(&self) -> bool {
        signing::verify(&self.from, &self.id, &self.signature)
    }
}

/// Per-node lifecycle of a transaction. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxState {
    Pending,
    InBlock,
    Finalized,
}

impl TxState {
    /// Moves to `next` if it is further along. Returns whether the state changed.
    pub fn advance(&mut self, next: TxState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}
