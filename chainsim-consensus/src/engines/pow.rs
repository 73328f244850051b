//! Proof-of-Work: nonce search against a leading-zero target, longest-chain
//! fork choice and depth-based finality.

use std::any::Any;

use chainsim_common::{
    env::consensus::{ConsensusKind, ConsensusState, PowState},
    Block, BlockProof, Transaction,
};
use chainsim_ledger::Node;
use chainsim_p2p::{MessagePayload, Network, NetworkMessage};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::gossip::admit_and_gossip;
use crate::consensus::{ConsensusEngine, ConsensusParams};

/// A block meets the target iff its id re-derives from the header and starts
/// with `difficulty` zero characters.
pub fn is_valid_pow(block: &Block, difficulty: usize) -> bool {
    block.has_consistent_id() && block.id.len() >= difficulty && block.id.bytes().take(difficulty).all(|c| c == b'0')
}

fn pow_state(node: &mut Node) -> Option<&mut PowState> {
    node.consensus_state.as_mut().and_then(ConsensusState::as_pow_mut)
}

pub struct PowEngine {
    params: ConsensusParams,
}

impl PowEngine {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }

    pub fn is_valid_pow(&self, block: &Block) -> bool {
        is_valid_pow(block, self.params.difficulty)
    }

    pub fn set_mining(&self, node: &mut Node, mining: bool) {
        if let Some(state) = pow_state(node) {
            state.mining = mining;
        }
    }

    pub fn set_hash_power(&self, node: &mut Node, hash_power: u64) {
        if let Some(state) = pow_state(node) {
            state.hash_power = hash_power;
        }
    }

    /// Adopts the deepest tip in the block store, but only when strictly higher
    /// than the head. Equal-height competitors never displace the head.
    fn fork_choice(&self, node: &mut Node) -> bool {
        let best = node.best_tip();
        if best.height <= node.head_height() {
            return false;
        }
        let best_id = best.id.clone();
        if !node.is_ancestor(node.head_id(), &best_id) {
            info!("🔀 [{}] Reorg from {} to longer branch {} (height {})", node.id, node.head_id(), best_id, best.height);
        }
        node.set_head(&best_id)
    }

    /// Finalizes the head-chain block that has `confirmations` blocks on top
    /// of and including itself. After a reorg this re-anchors finality on the
    /// new chain.
    fn update_finality(&self, node: &mut Node) {
        let depth = self.params.confirmations.max(1);
        let target = (node.head_height() + 1).saturating_sub(depth);
        if let Some(id) = node.block_at_height(target).map(|b| b.id.clone()) {
            node.set_finalized(&id);
        }
    }

    fn try_mine(&self, node: &mut Node, now: u64, network: &mut Network) {
        let Some(state) = pow_state(node) else {
            error!("[{}] PoW tick before init", node.id);
            return;
        };
        if !state.mining || state.hash_power == 0 {
            state.block_just_mined = false;
            return;
        }
        let hash_power = state.hash_power;

        let txs = node.valid_pending_transactions(self.params.max_block_txs);
        if txs.is_empty() {
            if let Some(state) = pow_state(node) {
                state.block_just_mined = false;
            }
            return;
        }

        let target_height = node.head_height() + 1;
        let mut candidate = Block::new(
            node.head(),
            node.id.clone(),
            0,
            txs,
            BlockProof::Pow { nonce: 0, difficulty: self.params.difficulty },
            now,
        );

        let Some(state) = pow_state(node) else { return };
        if state.mining_height != target_height {
            state.mining_height = target_height;
            state.current_nonce = 0;
        }
        let start = state.native_nonce.wrapping_add(state.current_nonce);

        let mut found = None;
        let mut attempts = 0;
        for i in 0..hash_power {
            attempts += 1;
            candidate = candidate.with_proof(BlockProof::Pow { nonce: start.wrapping_add(i), difficulty: self.params.difficulty });
            if self.is_valid_pow(&candidate) {
                found = Some(candidate);
                break;
            }
        }

        state.current_nonce += attempts;
        state.total_hashes += attempts;
        state.block_just_mined = false;

        let Some(block) = found else { return };

        state.current_nonce = 0;
        state.mining_height = block.height + 1;
        state.last_block_time = now;
        state.block_just_mined = true;
        state.blocks_mined += 1;

        info!("⛏️ [{}] Mined block {} at height {} ({} txs)", node.id, block.id, block.height, block.tx_ids.len());
        tracing::info!(target: "consensus", "EVENT:MINED node={} block={} height={}", node.id, block.id, block.height);

        node.add_block(block.clone());
        self.fork_choice(node);
        self.update_finality(node);
        network.broadcast(&node.id, node.peers.iter(), MessagePayload::BlockPropose { block }, None);
    }

    fn handle_block(&self, node: &mut Node, block: &Block, msg: &NetworkMessage, network: &mut Network) {
        if node.has_block(&block.id) {
            return;
        }
        if !self.is_valid_pow(block) {
            warn!("[{}] Rejected block {} from {}: invalid proof of work", node.id, block.id, msg.from);
            return;
        }
        let parent_known = block.parent_id.as_deref().map(|p| node.has_block(p)).unwrap_or(false);
        if !parent_known {
            debug!("[{}] Rejected block {}: unknown parent", node.id, block.id);
            return;
        }

        if block.height == node.head_height() && block.id != node.head_id() {
            info!("⑂ [{}] Fork at height {}: {} vs head {}", node.id, block.height, block.id, node.head_id());
            tracing::info!(target: "consensus", "EVENT:FORK node={} height={} block={}", node.id, block.height, block.id);
        }

        node.add_block(block.clone());
        if self.fork_choice(node) {
            if let Some(state) = pow_state(node) {
                state.current_nonce = 0;
            }
        }
        self.update_finality(node);
        network.broadcast(
            &node.id,
            node.peers.iter(),
            MessagePayload::BlockPropose { block: block.clone() },
            Some(&msg.from),
        );
    }
}

impl ConsensusEngine for PowEngine {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Pow
    }

    fn params(&self) -> &ConsensusParams {
        &self.params
    }

    fn init(&self, node: &mut Node, network: &mut Network) {
        // Keep headroom so nonce arithmetic never wraps in practice.
        let native_nonce = network.random_u64() >> 16;
        node.consensus_state = Some(ConsensusState::Pow(PowState {
            mining: true,
            hash_power: self.params.hash_power,
            native_nonce,
            current_nonce: 0,
            mining_height: node.head_height() + 1,
            last_block_time: network.now(),
            ..Default::default()
        }));
    }

    fn on_tx(&self, node: &mut Node, tx: Transaction, network: &mut Network) -> bool {
        admit_and_gossip(node, tx, network, None)
    }

    fn on_message(&self, node: &mut Node, msg: &NetworkMessage, network: &mut Network) {
        match &msg.payload {
            MessagePayload::TxGossip { tx } => {
                admit_and_gossip(node, tx.clone(), network, Some(&msg.from));
            }
            MessagePayload::BlockPropose { block } => self.handle_block(node, block, msg, network),
            _ => debug!("[{}] PoW ignoring {}", node.id, msg.msg_type),
        }
    }

    fn on_tick(&self, node: &mut Node, now: u64, network: &mut Network) {
        self.try_mine(node, now, network);
    }

    fn role(&self, node: &Node) -> String {
        match node.consensus_state.as_ref().and_then(ConsensusState::as_pow) {
            Some(s) if s.mining && s.block_just_mined => "Miner (block found)".to_string(),
            Some(s) if s.mining => "Miner".to_string(),
            Some(_) => "Idle".to_string(),
            None => "Uninitialized".to_string(),
        }
    }

    fn ui_state(&self, node: &Node) -> serde_json::Value {
        let Some(s) = node.consensus_state.as_ref().and_then(ConsensusState::as_pow) else {
            return serde_json::Value::Null;
        };
        json!({
            "mining": s.mining,
            "hashPower": s.hash_power,
            "nativeNonce": s.native_nonce,
            "currentNonce": s.current_nonce,
            "miningHeight": s.mining_height,
            "lastBlockTime": s.last_block_time,
            "blockJustMined": s.block_just_mined,
            "blocksMined": s.blocks_mined,
            "totalHashes": s.total_hashes,
            "difficulty": self.params.difficulty,
            "confirmations": self.params.confirmations,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engines::testkit::Cluster;
    use chainsim_common::{NodeId, TxState};

    fn mine_until_valid(parent: &Block, difficulty: usize) -> Block {
        let mut nonce = 0;
        loop {
            let b = Block::new(parent, NodeId::from("m"), 0, vec![], BlockProof::Pow { nonce, difficulty }, 1);
            if is_valid_pow(&b, difficulty) {
                return b;
            }
            nonce += 1;
        }
    }

    #[test]
    fn test_is_valid_pow_checks_prefix() {
        let b = mine_until_valid(&Block::genesis(), 2);
        assert!(b.id.starts_with("00"));
        assert!(is_valid_pow(&b, 2));
        assert!(is_valid_pow(&b, 0));

        let mut forged = b.clone();
        forged.timestamp += 1;
        assert!(!is_valid_pow(&forged, 2), "id no longer matches header");

        let mut n = 0;
        let plain = loop {
            let c = Block::new(&Block::genesis(), NodeId::from("m"), 0, vec![], BlockProof::Pow { nonce: n, difficulty: 1 }, 1);
            if !c.id.starts_with('0') {
                break c;
            }
            n += 1;
        };
        assert!(!is_valid_pow(&plain, 1));
    }

    #[test]
    fn test_single_miner_finalizes_tx_everywhere() {
        let engine = Arc::new(PowEngine::new(ConsensusParams { hash_power: 200, ..Default::default() }));
        let mut c = Cluster::new(4, engine.clone());
        for i in 1..4 {
            engine.set_mining(c.node_mut(i), false);
        }

        let tx = c.submit(0, "bob", 10, 0);
        c.run(200, 100);

        let head = c.node(0).head_id().to_string();
        assert!(c.node(0).head_height() >= 1);
        for i in 0..4 {
            let n = c.node(i);
            assert_eq!(n.head_id(), head);
            assert_eq!(n.tx_state(&tx.id), Some(TxState::Finalized));
            assert!(n.mempool.is_empty());
        }
        let containing = c.node(0).get_chain(&head).iter().filter(|b| b.contains_tx(&tx.id)).count();
        assert_eq!(containing, 1);
    }

    #[test]
    fn test_fork_choice_never_adopts_equal_height() {
        let engine = PowEngine::new(ConsensusParams::default());
        let mut c = Cluster::new(1, Arc::new(PowEngine::new(ConsensusParams::default())));
        let node = c.node_mut(0);

        let a = mine_until_valid(&Block::genesis(), 2);
        let mut nonce = 0;
        let b = loop {
            let cand = Block::new(&Block::genesis(), NodeId::from("other"), 0, vec![], BlockProof::Pow { nonce, difficulty: 2 }, 2);
            if is_valid_pow(&cand, 2) {
                break cand;
            }
            nonce += 1;
        };

        node.add_block(a.clone());
        assert!(engine.fork_choice(node));
        assert_eq!(node.head_id(), a.id);

        node.add_block(b);
        assert!(!engine.fork_choice(node));
        assert_eq!(node.head_id(), a.id);
    }

    fn mine_on(parent: &Block, producer: &str, ts: u64) -> Block {
        let mut nonce = 0;
        loop {
            let b = Block::new(parent, NodeId::from(producer), 0, vec![], BlockProof::Pow { nonce, difficulty: 2 }, ts);
            if is_valid_pow(&b, 2) {
                return b;
            }
            nonce += 1;
        }
    }

    #[test]
    fn test_longer_branch_wins_over_finalized_tip() {
        let engine = PowEngine::new(ConsensusParams::default());
        let mut c = Cluster::new(1, Arc::new(PowEngine::new(ConsensusParams::default())));
        let node = c.node_mut(0);

        let own = mine_on(&Block::genesis(), "n0", 1);
        node.add_block(own.clone());
        engine.fork_choice(node);
        engine.update_finality(node);
        assert_eq!(node.finalized_id(), own.id);

        let b1 = mine_on(&Block::genesis(), "other", 2);
        let b2 = mine_on(&b1, "other", 3);
        node.add_block(b1.clone());
        assert!(!engine.fork_choice(node), "tie keeps the head");
        node.add_block(b2.clone());
        assert!(engine.fork_choice(node));
        engine.update_finality(node);

        assert_eq!(node.head_id(), b2.id);
        assert_eq!(node.finalized_id(), b2.id);
        assert!(node.is_ancestor(&b1.id, node.finalized_id()));
    }

    #[test]
    fn test_deeper_confirmations_reanchor_on_reorg() {
        let engine = PowEngine::new(ConsensusParams { confirmations: 2, ..Default::default() });
        let mut c = Cluster::new(1, Arc::new(PowEngine::new(ConsensusParams::default())));
        let node = c.node_mut(0);

        let a1 = mine_on(&Block::genesis(), "n0", 1);
        let a2 = mine_on(&a1, "n0", 2);
        node.add_block(a1.clone());
        node.add_block(a2);
        engine.fork_choice(node);
        engine.update_finality(node);
        assert_eq!(node.finalized_id(), a1.id);

        let b1 = mine_on(&Block::genesis(), "other", 3);
        let b2 = mine_on(&b1, "other", 4);
        let b3 = mine_on(&b2, "other", 5);
        for b in [b1.clone(), b2, b3.clone()] {
            node.add_block(b);
        }
        assert!(engine.fork_choice(node));
        engine.update_finality(node);
        assert_eq!(node.head_id(), b3.id);
        assert_eq!(node.finalized_height(), 2);
        assert!(node.is_ancestor(node.finalized_id(), node.head_id()));
        assert!(!node.is_ancestor(&a1.id, node.head_id()));
    }

    #[test]
    fn test_idle_miner_does_nothing() {
        let engine = Arc::new(PowEngine::new(ConsensusParams::default()));
        let mut c = Cluster::new(2, engine.clone());
        c.run(20, 100);
        assert_eq!(c.node(0).head_height(), 0);
        assert_eq!(engine.role(c.node(0)), "Miner");
        engine.set_mining(c.node_mut(0), false);
        assert_eq!(engine.role(c.node(0)), "Idle");
    }
}
