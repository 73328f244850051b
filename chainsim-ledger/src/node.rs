//! node.rs
//!
//! Per-participant chain state: a block store holding every block the node has
//! seen, the head and finalized pointers, the mempool, per-transaction
//! lifecycle, the peer set and the engine-owned consensus state.
//!
//! Nothing here is shared between nodes. Other nodes only influence this state
//! through messages handed to the consensus engine.

use std::collections::{BTreeSet, HashMap};

use chainsim_common::{
    env::consensus::ConsensusState,
    error::{ChainSimError, Result},
    genesis::GenesisState,
    transactions::{Transaction, TransactionError, TransactionValidator, TxState},
    Block, NodeId,
};
use chainsim_mempool::Mempool;
use tracing::{debug, info};

use crate::ledger::Ledger;

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// Canvas position, only meaningful to the display layer.
    pub position: (f64, f64),
    blocks: HashMap<String, Block>,
    head_id: String,
    finalized_id: String,
    pub mempool: Mempool,
    tx_states: HashMap<String, TxState>,
    pub peers: BTreeSet<NodeId>,
    genesis: GenesisState,
    ledger: Ledger,
    pub consensus_state: Option<ConsensusState>,
}

impl Node {
    /// Creates a node whose store holds only the genesis block.
    pub fn new(id: NodeId, genesis: GenesisState) -> Self {
        let genesis_block = Block::genesis();
        let genesis_id = genesis_block.id.clone();
        let ledger = Ledger::replay(&genesis, [&genesis_block]);
        let mut blocks = HashMap::new();
        blocks.insert(genesis_id.clone(), genesis_block);

        Self {
            id,
            position: (0.0, 0.0),
            blocks,
            head_id: genesis_id.clone(),
            finalized_id: genesis_id,
            mempool: Mempool::new(),
            tx_states: HashMap::new(),
            peers: BTreeSet::new(),
            genesis,
            ledger,
            consensus_state: None,
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = (x, y);
        self
    }

    // ---- block store ----

    pub fn head_id(&self) -> &str {
        &self.head_id
    }

    pub fn finalized_id(&self) -> &str {
        &self.finalized_id
    }

    pub fn head(&self) -> &Block {
        // set_head only accepts stored blocks and the store never shrinks
        &self.blocks[&self.head_id]
    }

    pub fn finalized(&self) -> &Block {
        &self.blocks[&self.finalized_id]
    }

    pub fn head_height(&self) -> u64 {
        self.head().height
    }

    pub fn finalized_height(&self) -> u64 {
        self.finalized().height
    }

    pub fn get_block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn has_block(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Stores a block whose parent is known. Returns false for duplicates and orphans.
    ///
    /// Its transactions become `IN_BLOCK` and leave the mempool.
    pub fn add_block(&mut self, block: Block) -> bool {
        if self.blocks.contains_key(&block.id) {
            return false;
        }
        match &block.parent_id {
            Some(parent) if self.blocks.contains_key(parent) => {}
            _ => {
                debug!("[{}] Ignoring block {} with unknown parent", self.id, block.id);
                return false;
            }
        }

        for tx_id in &block.tx_ids {
            self.tx_states
                .entry(tx_id.clone())
                .or_insert(TxState::InBlock)
                .advance(TxState::InBlock);
        }
        self.mempool.remove_batch(&block.tx_ids);
        self.blocks.insert(block.id.clone(), block);
        true
    }

    /// Blocks from genesis up to `tip_id`, genesis first.
    pub fn get_chain(&self, tip_id: &str) -> Vec<&Block> {
        let mut chain = Vec::new();
        let mut cursor = self.blocks.get(tip_id);
        while let Some(block) = cursor {
            chain.push(block);
            cursor = block.parent_id.as_ref().and_then(|p| self.blocks.get(p));
        }
        chain.reverse();
        chain
    }

    /// The ancestor of `tip_id` (or `tip_id` itself) at `height`.
    pub fn ancestor_at_height(&self, tip_id: &str, height: u64) -> Option<&Block> {
        let mut cursor = self.blocks.get(tip_id)?;
        if cursor.height < height {
            return None;
        }
        while cursor.height > height {
            cursor = self.blocks.get(cursor.parent_id.as_ref()?)?;
        }
        Some(cursor)
    }

    /// Block at `height` on the current head chain.
    pub fn block_at_height(&self, height: u64) -> Option<&Block> {
        self.ancestor_at_height(&self.head_id, height)
    }

    /// Ancestor-or-self test.
    pub fn is_ancestor(&self, ancestor_id: &str, descendant_id: &str) -> bool {
        let Some(ancestor) = self.blocks.get(ancestor_id) else {
            return false;
        };
        self.ancestor_at_height(descendant_id, ancestor.height)
            .map(|b| b.id == ancestor.id)
            .unwrap_or(false)
    }

    /// Deepest known tip. Ties prefer the earlier timestamp, then the smaller id.
    pub fn best_tip(&self) -> &Block {
        self.blocks
            .values()
            .max_by(|a, b| {
                a.height
                    .cmp(&b.height)
                    .then_with(|| b.timestamp.cmp(&a.timestamp))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .unwrap_or_else(|| self.head())
    }

    /// Moves the head and rebuilds the ledger from genesis. Unknown ids are ignored.
    pub fn set_head(&mut self, id: &str) -> bool {
        if !self.blocks.contains_key(id) || self.head_id == id {
            return false;
        }
        self.head_id = id.to_string();
        self.ledger = Ledger::replay(&self.genesis, self.get_chain(id));
        debug!("[{}] Head -> {} (height {})", self.id, id, self.head_height());
        true
    }

    /// Moves the finalized pointer to `id`, which must be on the head chain.
    ///
    /// While the finalized block is itself on the head chain the pointer only
    /// moves forward. Once the head has switched to another branch it
    /// re-anchors on the new chain at any height. Transactions up to `id`
    /// become `FINALIZED` and leave the mempool.
    pub fn set_finalized(&mut self, id: &str) -> bool {
        let Some(block) = self.blocks.get(id) else {
            return false;
        };
        if !self.is_ancestor(id, &self.head_id) {
            return false;
        }
        let on_head_chain = self.is_ancestor(&self.finalized_id, &self.head_id);
        if on_head_chain && block.height <= self.finalized_height() {
            return false;
        }

        self.finalized_id = id.to_string();
        let tx_ids: Vec<String> = self
            .get_chain(id)
            .iter()
            .flat_map(|b| b.tx_ids.iter().cloned())
            .collect();
        for tx_id in &tx_ids {
            self.tx_states
                .entry(tx_id.clone())
                .or_insert(TxState::Finalized)
                .advance(TxState::Finalized);
        }
        self.mempool.remove_batch(&tx_ids);

        info!("✅ [{}] Finalized block {} at height {}", self.id, id, self.finalized_height());
        tracing::info!(target: "consensus", "EVENT:FINALIZE node={} block={} height={}", self.id, id, self.finalized_height());
        true
    }

    // ---- ledger & transactions ----

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn genesis_state(&self) -> &GenesisState {
        &self.genesis
    }

    pub fn tx_state(&self, tx_id: &str) -> Option<TxState> {
        self.tx_states.get(tx_id).copied()
    }

    pub fn tx_states(&self) -> &HashMap<String, TxState> {
        &self.tx_states
    }

    /// Admits a transaction to the mempool.
    ///
    /// Returns Ok(true) if new, Ok(false) if already pending. The nonce must
    /// follow the sender's ledger nonce plus its pending transactions.
    pub fn admit_transaction(&mut self, tx: Transaction) -> std::result::Result<bool, TransactionError> {
        if matches!(self.tx_state(&tx.id), Some(TxState::InBlock | TxState::Finalized)) {
            return Err(TransactionError::AlreadyCommitted(tx.id));
        }
        if self.mempool.contains(&tx.id) {
            return Ok(false);
        }

        TransactionValidator::validate_stateless(&tx)?;

        let balance = self.ledger.balance(&tx.from);
        if balance < tx.amount {
            return Err(TransactionError::InsufficientBalance {
                address: tx.from.clone(),
                balance,
                amount: tx.amount,
            });
        }
        let expected = self.ledger.expected_nonce(&tx.from) + self.mempool.pending_from(&tx.from);
        if tx.nonce != expected {
            return Err(TransactionError::NonceMismatch {
                address: tx.from.clone(),
                expected,
                got: tx.nonce,
            });
        }

        let id = tx.id.clone();
        let added = self.mempool.add(tx)?;
        if added {
            self.tx_states.insert(id, TxState::Pending);
        }
        Ok(added)
    }

    /// Pending transactions that apply cleanly, in order, on top of the head ledger.
    pub fn valid_pending_transactions(&self, limit: usize) -> Vec<Transaction> {
        let mut scratch = self.ledger.clone();
        let mut selected = Vec::new();
        for tx in self.mempool.iter() {
            if selected.len() >= limit {
                break;
            }
            if scratch.apply_tx(tx).is_ok() {
                selected.push(tx.clone());
            }
        }
        selected
    }

    // ---- consensus state ----

    pub fn consensus(&self) -> Result<&ConsensusState> {
        self.consensus_state
            .as_ref()
            .ok_or_else(|| ChainSimError::NotInitialized(self.id.to_string()))
    }

    pub fn consensus_mut(&mut self) -> Result<&mut ConsensusState> {
        let id = self.id.to_string();
        self.consensus_state.as_mut().ok_or(ChainSimError::NotInitialized(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsim_common::BlockProof;

    fn node() -> Node {
        Node::new(NodeId::from("n0"), GenesisState::new().with_allocation("alice", 100))
    }

    fn child(parent: &Block, txs: Vec<Transaction>, ts: u64) -> Block {
        Block::new(parent, NodeId::from("n0"), 0, txs, BlockProof::Pow { nonce: 0, difficulty: 0 }, ts)
    }

    #[test]
    fn test_new_node_starts_at_genesis() {
        let n = node();
        assert_eq!(n.head_height(), 0);
        assert_eq!(n.head_id(), n.finalized_id());
        assert_eq!(n.block_count(), 1);
        assert!(n.consensus().is_err());
    }

    #[test]
    fn test_add_block_requires_parent() {
        let mut n = node();
        let b1 = child(n.head(), vec![], 1);
        let b2 = child(&b1, vec![], 2);
        assert!(!n.add_block(b2.clone()));
        assert!(n.add_block(b1.clone()));
        assert!(!n.add_block(b1));
        assert!(n.add_block(b2));
        assert_eq!(n.block_count(), 3);
    }

    #[test]
    fn test_tx_lifecycle() {
        let mut n = node();
        let tx = Transaction::signed("alice", "bob", 10, 0, 1);
        assert!(n.admit_transaction(tx.clone()).unwrap());
        assert_eq!(n.tx_state(&tx.id), Some(TxState::Pending));

        let b1 = child(n.head(), vec![tx.clone()], 1);
        let b1_id = b1.id.clone();
        n.add_block(b1);
        assert_eq!(n.tx_state(&tx.id), Some(TxState::InBlock));
        assert!(n.mempool.is_empty());

        assert!(n.set_head(&b1_id));
        assert_eq!(n.ledger().balance("bob"), 10);
        assert!(n.set_finalized(&b1_id));
        assert_eq!(n.tx_state(&tx.id), Some(TxState::Finalized));

        assert!(matches!(n.admit_transaction(tx), Err(TransactionError::AlreadyCommitted(_))));
    }

    #[test]
    fn test_admission_checks_nonce_with_pending() {
        let mut n = node();
        assert!(n.admit_transaction(Transaction::signed("alice", "bob", 1, 0, 1)).unwrap());
        assert!(n.admit_transaction(Transaction::signed("alice", "bob", 1, 1, 1)).unwrap());
        assert!(matches!(
            n.admit_transaction(Transaction::signed("alice", "bob", 1, 5, 1)),
            Err(TransactionError::NonceMismatch { expected: 2, .. })
        ));
        assert_eq!(n.valid_pending_transactions(10).len(), 2);
        assert_eq!(n.valid_pending_transactions(1).len(), 1);
    }

    #[test]
    fn test_finality_stays_on_head_chain_and_moves_forward() {
        let mut n = node();
        let b1 = child(n.head(), vec![], 1);
        let fork = child(n.head(), vec![], 2);
        let b2 = child(&b1, vec![], 3);
        let (b1_id, fork_id, b2_id) = (b1.id.clone(), fork.id.clone(), b2.id.clone());
        n.add_block(b1);
        n.add_block(fork);
        n.add_block(b2);
        n.set_head(&b2_id);

        assert!(!n.set_finalized(&fork_id));
        assert!(n.set_finalized(&b2_id));
        assert!(!n.set_finalized(&b1_id));
        assert_eq!(n.finalized_height(), 2);
    }

    #[test]
    fn test_chain_queries() {
        let mut n = node();
        let b1 = child(n.head(), vec![], 1);
        let b2 = child(&b1, vec![], 2);
        let fork = child(n.head(), vec![], 3);
        let (b1_id, b2_id, fork_id) = (b1.id.clone(), b2.id.clone(), fork.id.clone());
        n.add_block(b1);
        n.add_block(b2);
        n.add_block(fork);

        assert_eq!(n.get_chain(&b2_id).len(), 3);
        assert!(n.is_ancestor(&b1_id, &b2_id));
        assert!(n.is_ancestor(&b2_id, &b2_id));
        assert!(!n.is_ancestor(&fork_id, &b2_id));
        assert_eq!(n.best_tip().id, b2_id);
        assert_eq!(n.ancestor_at_height(&b2_id, 1).map(|b| b.id.clone()), Some(b1_id));
        assert!(n.ancestor_at_height(&b2_id, 5).is_none());
    }

    #[test]
    fn test_finality_reanchors_after_branch_switch() {
        let mut n = node();
        let a1 = child(n.head(), vec![], 1);
        let b1 = child(n.head(), vec![], 2);
        let b2 = child(&b1, vec![], 3);
        let (a1_id, b1_id, b2_id) = (a1.id.clone(), b1.id.clone(), b2.id.clone());
        n.add_block(a1);
        n.add_block(b1);
        n.add_block(b2);

        n.set_head(&a1_id);
        assert!(n.set_finalized(&a1_id));

        // Still on the finalized branch: no going back.
        assert!(!n.set_finalized(&Block::genesis().id));

        n.set_head(&b2_id);
        assert!(!n.set_finalized(&a1_id), "off the head chain");
        assert!(n.set_finalized(&b1_id), "same height, new branch");
        assert_eq!(n.finalized_id(), b1_id);
        assert!(!n.set_finalized(&b1_id));
        assert!(n.set_finalized(&b2_id));
        assert_eq!(n.finalized_height(), 2);
    }
}
