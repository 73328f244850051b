use serde::{Deserialize, Serialize};

use crate::{crypto::digest, genesis, transactions::Transaction, utils::NodeId};

/// Protocol-specific payload proving a block's right to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockProof {
    Genesis,
    Pow { nonce: u64, difficulty: usize },
    Pos { stake: u64, slot: u64 },
    Raft { term: u64 },
    Pbft { view: u64, sequence: u64 },
}

/// An immutable block.
///
/// `round` carries the protocol epoch: 0 for PoW, the slot for PoS,
/// the term for Raft and the view for PBFT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub parent_id: Option<String>,
    pub height: u64,
    pub producer_id: NodeId,
    pub round: u64,
    pub tx_ids: Vec<String>,
    pub transactions: Vec<Transaction>,
    pub proof: BlockProof,
    pub timestamp: u64,
}

#[derive(Serialize)]
struct BlockHeaderView<'a> {
    parent_id: &'a Option<String>,
    height: u64,
    producer_id: &'a NodeId,
    round: u64,
    tx_ids: &'a [String],
    proof: &'a BlockProof,
    timestamp: u64,
}

impl Block {
    /// Builds a child of `parent` and derives its id.
    pub fn new(
        parent: &Block,
        producer_id: NodeId,
        round: u64,
        transactions: Vec<Transaction>,
        proof: BlockProof,
        timestamp: u64,
    ) -> Self {
        let tx_ids = transactions.iter().map(|tx| tx.id.clone()).collect();
        let mut block = Self {
            id: String::new(),
            parent_id: Some(parent.id.clone()),
            height: parent.height + 1,
            producer_id,
            round,
            tx_ids,
            transactions,
            proof,
            timestamp,
        };
        block.id = block.compute_id();
        block
    }

    /// The shared height-0 block every node starts from.
    pub fn genesis() -> Self {
        Self {
            id: genesis::GENESIS_ID.to_string(),
            parent_id: None,
            height: 0,
            producer_id: NodeId(genesis::GENESIS_PRODUCER.to_string()),
            round: 0,
            tx_ids: Vec::new(),
            transactions: Vec::new(),
            proof: BlockProof::Genesis,
            timestamp: 0,
        }
    }

    /// Hash of the header, timestamp and proof included.
    pub fn compute_id(&self) -> String {
        let view = BlockHeaderView {
            parent_id: &self.parent_id,
            height: self.height,
            producer_id: &self.producer_id,
            round: self.round,
            tx_ids: &self.tx_ids,
            proof: &self.proof,
            timestamp: self.timestamp,
        };
        digest(&bincode::serialize(&view).unwrap_or_default())
    }

    /// Replaces the proof and re-derives the id. Used by miners iterating nonces.
    pub fn with_proof(mut self, proof: BlockProof) -> Self {
        self.proof = proof;
        self.id = self.compute_id();
        self
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_id.is_none() && self.id == genesis::GENESIS_ID
    }

    /// True when the id hashes back to the header (genesis is synthetic).
    pub fn has_consistent_id(&self) -> bool {
        self.is_genesis() || self.id == self.compute_id()
    }

    pub fn contains_tx(&self, tx_id: &str) -> bool {
        self.tx_ids.iter().any(|id| id == tx_id)
    }
}
