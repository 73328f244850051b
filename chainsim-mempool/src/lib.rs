use std::collections::{HashMap, HashSet, VecDeque};

use chainsim_common::transactions::{Transaction, TransactionError, TransactionValidator};
use tracing::debug;

/// Upper bound on remembered committed ids.
const COMMITTED_CACHE_LIMIT: usize = 50_000;

/// Per-node pool of admitted transactions not yet included in a local block.
///
/// Candidates come out in admission order.
#[derive(Debug, Default, Clone)]
pub struct Mempool {
    // Key is tx id
    transactions: HashMap<String, Transaction>,
    order: VecDeque<String>,
    // Ids already included in a local block, to reject re-admission
    committed_cache: HashSet<String>,
    committed_order: VecDeque<String>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transaction to the mempool.
    /// Returns Ok(true) if added, Ok(false) if duplicate, Err if invalid or already committed.
    pub fn add(&mut self, tx: Transaction) -> Result<bool, TransactionError> {
        TransactionValidator::validate_stateless(&tx)?;

        if self.committed_cache.contains(&tx.id) {
            return Err(TransactionError::AlreadyCommitted(tx.id));
        }

        if self.transactions.contains_key(&tx.id) {
            return Ok(false);
        }
        self.order.push_back(tx.id.clone());
        self.transactions.insert(tx.id.clone(), tx);
        Ok(true)
    }

    /// Removes transactions included in a block and remembers them as committed.
    pub fn remove_batch(&mut self, tx_ids: &[String]) {
        let mut removed = 0;
        for id in tx_ids {
            if self.transactions.remove(id).is_some() {
                removed += 1;
            }
            if self.committed_cache.insert(id.clone()) {
                self.committed_order.push_back(id.clone());
            }
        }
        if removed > 0 {
            self.order.retain(|id| self.transactions.contains_key(id));
            debug!("🧹 Removed {} transactions from mempool", removed);
        }

        while self.committed_order.len() > COMMITTED_CACHE_LIMIT {
            if let Some(old) = self.committed_order.pop_front() {
                self.committed_cache.remove(&old);
            }
        }
    }

    /// All pending transactions in admission order.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.order.iter().filter_map(|id| self.transactions.get(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transactions.contains_key(id)
    }

    /// Number of pending transactions sent by `address`.
    pub fn pending_from(&self, address: &str) -> u64 {
        self.transactions.values().filter(|tx| tx.from == address).count() as u64
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(nonce: u64) -> Transaction {
        Transaction::signed("alice", "bob", 10, nonce, 1)
    }

    #[test]
    fn test_add_and_duplicate() {
        let mut pool = Mempool::new();
        assert!(pool.add(tx(0)).unwrap());
        assert!(!pool.add(tx(0)).unwrap());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_rejects_unsigned() {
        let mut pool = Mempool::new();
        let unsigned = Transaction::new("alice", "bob", 10, 0, 1);
        assert!(pool.add(unsigned).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_candidates_keep_admission_order() {
        let mut pool = Mempool::new();
        for n in [3, 1, 2] {
            pool.add(tx(n)).unwrap();
        }
        let nonces: Vec<u64> = pool.iter().map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![3, 1, 2]);
    }

    #[test]
    fn test_removed_transactions_cannot_return() {
        let mut pool = Mempool::new();
        let t = tx(0);
        pool.add(t.clone()).unwrap();
        pool.remove_batch(&[t.id.clone()]);
        assert!(pool.is_empty());
        assert_eq!(pool.add(t.clone()), Err(TransactionError::AlreadyCommitted(t.id)));
    }

    #[test]
    fn test_pending_from_counts_sender() {
        let mut pool = Mempool::new();
        pool.add(tx(0)).unwrap();
        pool.add(tx(1)).unwrap();
        pool.add(Transaction::signed("carol", "bob", 1, 0, 1)).unwrap();
        assert_eq!(pool.pending_from("alice"), 2);
        assert_eq!(pool.pending_from("carol"), 1);
        assert_eq!(pool.pending_from("dave"), 0);
    }
}
