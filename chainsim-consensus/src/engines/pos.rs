//! Proof-of-Stake: stake-weighted slot leaders, tentative adoption of
//! proposals and finality once enough stake has voted for a block.

use std::{
    any::Any,
    collections::BTreeMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chainsim_common::{
    crypto::hash_to_range,
    env::consensus::{ConsensusKind, ConsensusState, PosState},
    Block, BlockProof, NodeId, Transaction,
};
use chainsim_ledger::Node;
use chainsim_p2p::{MessagePayload, Network, NetworkMessage};
use serde_json::json;
use tracing::{debug, error, info};

use super::gossip::admit_and_gossip;
use crate::consensus::{evaluator::stake_quorum_reached, ConsensusEngine, ConsensusParams};

fn pos_state(node: &mut Node) -> Option<&mut PosState> {
    node.consensus_state.as_mut().and_then(ConsensusState::as_pos_mut)
}

fn pos_state_ref(node: &Node) -> Option<&PosState> {
    node.consensus_state.as_ref().and_then(ConsensusState::as_pos)
}

pub struct PosEngine {
    params: ConsensusParams,
    /// Network-wide stake table shared by every node under this engine.
    stakes: RwLock<BTreeMap<NodeId, u64>>,
}

impl PosEngine {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params, stakes: RwLock::new(BTreeMap::new()) }
    }

    fn stakes(&self) -> RwLockReadGuard<'_, BTreeMap<NodeId, u64>> {
        self.stakes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn stakes_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<NodeId, u64>> {
        self.stakes.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stake_of(&self, id: &NodeId) -> u64 {
        self.stakes().get(id).copied().unwrap_or(0)
    }

    pub fn total_stake(&self) -> u64 {
        self.stakes().values().sum()
    }

    /// Sets a node's stake. Zero removes it from the validator set.
    pub fn set_stake(&self, node: &mut Node, stake: u64) {
        self.stakes_mut().insert(node.id.clone(), stake);
        if let Some(state) = pos_state(node) {
            state.stake = stake;
            state.is_validator = stake > 0;
        }
        info!("🪙 [{}] Stake set to {}", node.id, stake);
    }

    pub fn slot_at(&self, now: u64) -> u64 {
        now / self.params.slot_duration.max(1)
    }

    /// Hashes the slot into `[0, total_stake)` and walks the cumulative stake
    /// table in id order.
    pub fn leader_for_slot(&self, slot: u64) -> Option<NodeId> {
        let stakes = self.stakes();
        let total: u64 = stakes.values().sum();
        if total == 0 {
            return None;
        }
        let pick = hash_to_range(format!("slot:{}", slot).as_bytes(), total);
        let mut cumulative = 0;
        for (id, stake) in stakes.iter().filter(|(_, s)| **s > 0) {
            cumulative += stake;
            if pick < cumulative {
                return Some(id.clone());
            }
        }
        None
    }

    fn voter_stake(&self, node: &Node, block_id: &str) -> u64 {
        let Some(voters) = pos_state_ref(node).and_then(|s| s.votes.get(block_id)) else {
            return 0;
        };
        let stakes = self.stakes();
        voters.iter().map(|v| stakes.get(v).copied().unwrap_or(0)).sum()
    }

    fn propose(&self, node: &mut Node, slot: u64, now: u64, network: &mut Network) {
        let txs = node.valid_pending_transactions(self.params.max_block_txs);
        if txs.is_empty() {
            return;
        }
        let stake = self.stake_of(&node.id);
        let block = Block::new(node.head(), node.id.clone(), slot, txs, BlockProof::Pos { stake, slot }, now);
        let block_id = block.id.clone();

        info!("📦 [{}] Proposing block {} for slot {} at height {}", node.id, block_id, slot, block.height);
        tracing::info!(target: "consensus", "EVENT:PROPOSE node={} block={} slot={} height={}", node.id, block_id, slot, block.height);

        node.add_block(block.clone());
        node.set_head(&block_id);
        if let Some(state) = pos_state(node) {
            state.pending_blocks.insert(block_id.clone());
            state.blocks_proposed += 1;
        }
        network.broadcast(&node.id, node.peers.iter(), MessagePayload::BlockPropose { block }, None);
        self.cast_vote(node, &block_id, slot, network);
    }

    /// One vote per slot per node.
    fn cast_vote(&self, node: &mut Node, block_id: &str, slot: u64, network: &mut Network) {
        let stake = self.stake_of(&node.id);
        let voter = node.id.clone();
        let Some(state) = pos_state(node) else { return };
        if !state.is_validator || !state.voted_slots.insert(slot) {
            return;
        }
        state.votes.entry(block_id.to_string()).or_default().insert(voter.clone());

        debug!("🗳️ [{}] Voting for {} in slot {}", voter, block_id, slot);
        network.broadcast(
            &voter,
            node.peers.iter(),
            MessagePayload::BlockVote { block_id: block_id.to_string(), slot, voter: voter.clone(), stake },
            None,
        );
        self.check_finality(node, block_id);
    }

    fn check_finality(&self, node: &mut Node, block_id: &str) {
        if !node.has_block(block_id) || self.is_finalized(node, block_id) {
            return;
        }
        let voted = self.voter_stake(node, block_id);
        if !stake_quorum_reached(voted, self.total_stake(), self.params.stake_quorum) {
            return;
        }

        if !node.is_ancestor(block_id, node.head_id()) {
            if !node.is_ancestor(node.finalized_id(), block_id) {
                return;
            }
            node.set_head(block_id);
        }
        if node.set_finalized(block_id) {
            let finalized = node.finalized_id().to_string();
            let settled: Vec<String> = pos_state_ref(node)
                .map(|s| s.pending_blocks.iter().filter(|id| node.is_ancestor(id, &finalized)).cloned().collect())
                .unwrap_or_default();
            if let Some(state) = pos_state(node) {
                for id in &settled {
                    state.pending_blocks.remove(id);
                }
            }
            info!("🏁 [{}] Block {} reached stake quorum ({} of {})", node.id, block_id, voted, self.total_stake());
        }
    }

    fn handle_proposal(&self, node: &mut Node, block: &Block, msg: &NetworkMessage, network: &mut Network) {
        if node.has_block(&block.id) {
            return;
        }
        let BlockProof::Pos { slot, .. } = block.proof else {
            debug!("[{}] Rejected block {}: not a stake proof", node.id, block.id);
            return;
        };
        let current = self.slot_at(network.now());
        if slot != current {
            debug!("[{}] Rejected block {}: slot {} but current is {}", node.id, block.id, slot, current);
            return;
        }
        if self.leader_for_slot(slot).as_ref() != Some(&block.producer_id) {
            debug!("[{}] Rejected block {}: {} is not leader of slot {}", node.id, block.id, block.producer_id, slot);
            return;
        }
        if !block.has_consistent_id() {
            debug!("[{}] Rejected block {}: id mismatch", node.id, block.id);
            return;
        }
        if !node.add_block(block.clone()) {
            return;
        }

        if node.is_ancestor(node.finalized_id(), &block.id) {
            node.set_head(&block.id);
        }
        if let Some(state) = pos_state(node) {
            state.pending_blocks.insert(block.id.clone());
        }
        network.broadcast(
            &node.id,
            node.peers.iter(),
            MessagePayload::BlockPropose { block: block.clone() },
            Some(&msg.from),
        );
        self.cast_vote(node, &block.id, slot, network);
        self.check_finality(node, &block.id);
    }

    fn handle_vote(&self, node: &mut Node, block_id: &str, slot: u64, voter: &NodeId, msg: &NetworkMessage, network: &mut Network) {
        let stake = self.stake_of(voter);
        if stake == 0 {
            debug!("[{}] Ignoring vote from non-validator {}", node.id, voter);
            return;
        }
        let Some(state) = pos_state(node) else { return };
        if !state.votes.entry(block_id.to_string()).or_default().insert(voter.clone()) {
            return;
        }
        network.broadcast(
            &node.id,
            node.peers.iter(),
            MessagePayload::BlockVote { block_id: block_id.to_string(), slot, voter: voter.clone(), stake },
            Some(&msg.from),
        );
        self.check_finality(node, block_id);
    }
}

impl ConsensusEngine for PosEngine {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Pos
    }

    fn params(&self) -> &ConsensusParams {
        &self.params
    }

    fn init(&self, node: &mut Node, _network: &mut Network) {
        let stake = *self.stakes_mut().entry(node.id.clone()).or_insert(self.params.default_stake);
        node.consensus_state = Some(ConsensusState::Pos(PosState {
            is_validator: stake > 0,
            stake,
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
            MessagePayload::BlockPropose { block } => self.handle_proposal(node, block, msg, network),
            MessagePayload::BlockVote { block_id, slot, voter, .. } => {
                self.handle_vote(node, block_id, *slot, voter, msg, network)
            }
            _ => debug!("[{}] PoS ignoring {}", node.id, msg.msg_type),
        }
    }

    fn on_tick(&self, node: &mut Node, now: u64, network: &mut Network) {
        let slot = self.slot_at(now);
        let Some(state) = pos_state(node) else {
            error!("[{}] PoS tick before init", node.id);
            return;
        };
        if state.current_slot == Some(slot) {
            return;
        }
        state.current_slot = Some(slot);
        let is_validator = state.is_validator;

        if is_validator && self.leader_for_slot(slot).as_ref() == Some(&node.id) {
            self.propose(node, slot, now, network);
        }
    }

    fn role(&self, node: &Node) -> String {
        match pos_state_ref(node) {
            Some(s) if !s.is_validator => "Observer".to_string(),
            Some(s) => match s.current_slot.and_then(|slot| self.leader_for_slot(slot)) {
                Some(leader) if leader == node.id => "Slot Leader".to_string(),
                _ => "Validator".to_string(),
            },
            None => "Uninitialized".to_string(),
        }
    }

    fn ui_state(&self, node: &Node) -> serde_json::Value {
        let Some(s) = pos_state_ref(node) else {
            return serde_json::Value::Null;
        };
        let head_votes = s.votes.get(node.head_id()).map(|v| v.len()).unwrap_or(0);
        json!({
            "isValidator": s.is_validator,
            "stake": s.stake,
            "totalStake": self.total_stake(),
            "currentSlot": s.current_slot,
            "slotLeader": s.current_slot.and_then(|slot| self.leader_for_slot(slot)),
            "votedSlots": s.voted_slots.len(),
            "pendingBlocks": s.pending_blocks.len(),
            "headVotes": head_votes,
            "headVoteStake": self.voter_stake(node, node.head_id()),
            "blocksProposed": s.blocks_proposed,
            "slotDuration": self.params.slot_duration,
        })
    }

    fn on_node_removed(&self, id: &NodeId) {
        self.stakes_mut().remove(id);
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
    use chainsim_common::TxState;

    fn engine() -> Arc<PosEngine> {
        Arc::new(PosEngine::new(ConsensusParams { slot_duration: 1_000, ..Default::default() }))
    }

    #[test]
    fn test_leader_selection_is_deterministic() {
        let e = engine();
        let _c = Cluster::new(4, e.clone());
        for slot in 0..50 {
            let a = e.leader_for_slot(slot);
            assert!(a.is_some());
            assert_eq!(a, e.leader_for_slot(slot));
        }
    }

    #[test]
    fn test_zero_stake_is_never_leader() {
        let e = engine();
        let mut c = Cluster::new(3, e.clone());
        e.set_stake(c.node_mut(1), 0);
        assert!(e.role(c.node(1)) == "Observer");
        for slot in 0..100 {
            assert_ne!(e.leader_for_slot(slot), Some(Cluster::id(1)));
        }
    }

    #[test]
    fn test_no_stake_no_leader() {
        let e = engine();
        assert_eq!(e.leader_for_slot(3), None);
    }

    #[test]
    fn test_finalizes_with_quorum() {
        let e = engine();
        let mut c = Cluster::new(4, e.clone());
        let tx = c.submit(0, "bob", 5, 0);
        c.run(100, 100);

        for i in 0..4 {
            assert_eq!(c.node(i).tx_state(&tx.id), Some(TxState::Finalized), "node {}", i);
            assert!(c.node(i).finalized_height() >= 1);
        }
    }

    #[test]
    fn test_below_quorum_never_finalizes() {
        let e = engine();
        let mut c = Cluster::new(4, e.clone());
        // The two remaining validators hold exactly half the stake.
        for i in 2..4 {
            let id = Cluster::id(i);
            c.network.unregister_node(&id);
            c.nodes.remove(&id);
        }
        let tx = c.submit(0, "bob", 5, 0);
        c.run(100, 100);
        assert_eq!(c.node(0).finalized_height(), 0);
        assert_ne!(c.node(0).tx_state(&tx.id), Some(TxState::Finalized));
    }

    #[test]
    fn test_node_removal_drops_stake() {
        let e = engine();
        let _c = Cluster::new(2, e.clone());
        assert_eq!(e.total_stake(), 200);
        e.on_node_removed(&Cluster::id(0));
        assert_eq!(e.total_stake(), 100);
    }
}
