use std::collections::{BTreeMap, HashSet};

use chainsim_common::{
    genesis::GenesisState,
    transactions::{Transaction, TransactionError, TransactionValidator},
    Block,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Account balances and nonces derived from a chain.
///
/// Never persisted on its own: it is always rebuilt by replaying blocks from
/// genesis over the seeded allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub balances: BTreeMap<String, u64>,
    pub nonces: BTreeMap<String, u64>,
    pub applied_blocks: HashSet<String>,
}

impl Ledger {
    pub fn new(genesis: &GenesisState) -> Self {
        Self {
            balances: genesis.allocations.clone(),
            nonces: BTreeMap::new(),
            applied_blocks: HashSet::new(),
        }
    }

    /// Replays `chain` (genesis first) over `genesis`.
    pub fn replay<'a>(genesis: &GenesisState, chain: impl IntoIterator<Item = &'a Block>) -> Self {
        let mut ledger = Self::new(genesis);
        for block in chain {
            ledger.apply_block(block);
        }
        ledger
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn expected_nonce(&self, address: &str) -> u64 {
        self.nonces.get(address).copied().unwrap_or(0)
    }

    /// Checks a transaction against this snapshot: signature, balance and nonce.
    pub fn validate_tx(&self, tx: &Transaction) -> Result<(), TransactionError> {
        TransactionValidator::validate_stateless(tx)?;

        let balance = self.balance(&tx.from);
        if balance < tx.amount {
            return Err(TransactionError::InsufficientBalance {
                address: tx.from.clone(),
                balance,
                amount: tx.amount,
            });
        }

        let expected = self.expected_nonce(&tx.from);
        if tx.nonce != expected {
            return Err(TransactionError::NonceMismatch {
                address: tx.from.clone(),
                expected,
                got: tx.nonce,
            });
        }
        Ok(())
    }

    pub fn apply_tx(&mut self, tx: &Transaction) -> Result<(), TransactionError> {
        self.validate_tx(tx)?;

        let from = self.balances.entry(tx.from.clone()).or_insert(0);
        *from -= tx.amount;
        *self.balances.entry(tx.to.clone()).or_insert(0) += tx.amount;
        *self.nonces.entry(tx.from.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Applies every valid transaction of `block`. Invalid ones are skipped.
    ///
    /// Idempotent per block id. Returns the number of transactions applied.
    pub fn apply_block(&mut self, block: &Block) -> usize {
        if !self.applied_blocks.insert(block.id.clone()) {
            return 0;
        }

        let mut applied = 0;
        for tx in &block.transactions {
            match self.apply_tx(tx) {
                Ok(()) => applied += 1,
                Err(e) => debug!("Skipping tx {} in block {}: {}", tx.id, block.id, e),
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsim_common::{BlockProof, NodeId};

    fn genesis() -> GenesisState {
        GenesisState::new().with_allocation("alice", 100)
    }

    fn block_with(parent: &Block, txs: Vec<Transaction>) -> Block {
        Block::new(parent, NodeId::from("n0"), 0, txs, BlockProof::Raft { term: 1 }, parent.timestamp + 1)
    }

    #[test]
    fn test_validate_tx() {
        let ledger = Ledger::new(&genesis());
        assert!(ledger.validate_tx(&Transaction::signed("alice", "bob", 50, 0, 1)).is_ok());
        assert!(matches!(
            ledger.validate_tx(&Transaction::signed("alice", "bob", 500, 0, 1)),
            Err(TransactionError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            ledger.validate_tx(&Transaction::signed("alice", "bob", 5, 3, 1)),
            Err(TransactionError::NonceMismatch { expected: 0, got: 3, .. })
        ));
    }

    #[test]
    fn test_apply_block_moves_funds() {
        let g = Block::genesis();
        let b1 = block_with(&g, vec![Transaction::signed("alice", "bob", 30, 0, 1)]);
        let ledger = Ledger::replay(&genesis(), [&g, &b1]);
        assert_eq!(ledger.balance("alice"), 70);
        assert_eq!(ledger.balance("bob"), 30);
        assert_eq!(ledger.expected_nonce("alice"), 1);
    }

    #[test]
    fn test_apply_block_is_idempotent() {
        let g = Block::genesis();
        let b1 = block_with(&g, vec![Transaction::signed("alice", "bob", 30, 0, 1)]);
        let mut ledger = Ledger::new(&genesis());
        assert_eq!(ledger.apply_block(&b1), 1);
        assert_eq!(ledger.apply_block(&b1), 0);
        assert_eq!(ledger.balance("alice"), 70);
    }

    #[test]
    fn test_replay_twice_is_identical() {
        let g = Block::genesis();
        let b1 = block_with(&g, vec![Transaction::signed("alice", "bob", 30, 0, 1)]);
        let b2 = block_with(
            &b1,
            vec![
                Transaction::signed("bob", "carol", 10, 0, 2),
                // overspend, skipped
                Transaction::signed("alice", "carol", 1_000, 1, 2),
            ],
        );
        let first = Ledger::replay(&genesis(), [&g, &b1, &b2]);
        let second = Ledger::replay(&genesis(), [&g, &b1, &b2]);
        assert_eq!(first, second);
        assert_eq!(first.balance("carol"), 10);
        assert_eq!(first.expected_nonce("alice"), 1);
    }
}
