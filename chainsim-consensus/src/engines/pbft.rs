//! PBFT: primary proposals, prepare and commit quorums of 2f+1 per sequence,
//! blocks applied strictly in sequence order.
//!
//! Lost messages are recovered on a timer. Every proposal interval the primary
//! re-broadcasts its outstanding pre-prepare (or, when idle, its last committed
//! block) and each node re-sends its own votes. Nodes that already committed a
//! sequence answer prepares for it with the block and their commit, which lets
//! a lagging replica rebuild the commit certificate on its own.

use std::any::Any;

use chainsim_common::{
    env::consensus::{ConsensusKind, ConsensusState, PbftPhase, PbftState},
    Block, BlockProof, NodeId, Transaction,
};
use chainsim_ledger::Node;
use chainsim_p2p::{MessagePayload, Network, NetworkMessage};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::gossip::admit_and_gossip;
use crate::consensus::{evaluator::bft_quorum, ConsensusEngine, ConsensusParams};

fn pbft_state(node: &mut Node) -> Option<&mut PbftState> {
    node.consensus_state.as_mut().and_then(ConsensusState::as_pbft_mut)
}

fn pbft_state_ref(node: &Node) -> Option<&PbftState> {
    node.consensus_state.as_ref().and_then(ConsensusState::as_pbft)
}

/// View a block was proposed in.
fn proof_view(block: &Block) -> Option<u64> {
    match block.proof {
        BlockProof::Pbft { view, .. } => Some(view),
        _ => None,
    }
}

/// Primary of `view`: sorted registered ids, indexed by view modulo count.
pub fn primary_for_view(network: &Network, view: u64) -> Option<NodeId> {
    let ids = network.node_ids();
    if ids.is_empty() {
        return None;
    }
    ids.get((view % ids.len() as u64) as usize).cloned()
}

pub struct PbftEngine {
    params: ConsensusParams,
}

impl PbftEngine {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }

    /// Bumps every node to one view past the highest seen and resets proposal
    /// timers. Uncommitted sequences are abandoned.
    pub fn change_view<'a>(&self, nodes: impl IntoIterator<Item = &'a mut Node>, now: u64) -> u64 {
        let mut nodes: Vec<&'a mut Node> = nodes.into_iter().collect();
        let view = nodes
            .iter()
            .filter_map(|n| pbft_state_ref(n).map(|s| s.view))
            .max()
            .unwrap_or(0)
            + 1;

        for node in nodes.iter_mut() {
            if let Some(state) = pbft_state(node) {
                let next = state.sequence;
                state.view = view;
                state.last_proposal = now;
                state.last_retransmit = now;
                state.phases.retain(|seq, _| *seq < next);
                state.pre_prepares.retain(|seq, _| *seq < next);
                state.prepares.retain(|seq, _| *seq < next);
                state.commits.retain(|seq, _| *seq < next);
            }
        }
        info!("🔄 View change -> {}", view);
        tracing::info!(target: "consensus", "EVENT:VIEW_CHANGE view={}", view);
        view
    }

    fn propose(&self, node: &mut Node, now: u64, network: &mut Network) {
        let Some(state) = pbft_state_ref(node) else { return };
        let (view, sequence) = (state.view, state.sequence);
        if state.pre_prepares.contains_key(&sequence) || sequence != node.head_height() + 1 {
            return;
        }
        let txs = node.valid_pending_transactions(self.params.max_block_txs);
        if txs.is_empty() {
            return;
        }

        let block = Block::new(node.head(), node.id.clone(), view, txs, BlockProof::Pbft { view, sequence }, now);
        if let Some(state) = pbft_state(node) {
            state.last_proposal = now;
            state.last_retransmit = now;
        }
        info!("📦 [{}] Primary proposing block {} for view {} sequence {}", node.id, block.id, view, sequence);
        tracing::info!(target: "consensus", "EVENT:PRE_PREPARE node={} view={} seq={} block={}", node.id, view, sequence, block.id);

        let primary = node.id.clone();
        network.broadcast_all(
            &primary,
            MessagePayload::PbftPrePrepare { view, sequence, block: block.clone(), primary: primary.clone() },
            None,
        );
        self.accept_pre_prepare(node, view, sequence, &block, &primary, &primary, network);
    }

    /// Logs a proposal for `sequence` and casts this node's prepare for it.
    ///
    /// A proposal from an earlier view is only taken when relayed by a node
    /// other than its producer. The producer's own copy may be an abandoned
    /// one still in flight across a view change.
    #[allow(clippy::too_many_arguments)]
    fn accept_pre_prepare(
        &self,
        node: &mut Node,
        view: u64,
        sequence: u64,
        block: &Block,
        primary: &NodeId,
        from: &NodeId,
        network: &mut Network,
    ) {
        let expected_primary = primary_for_view(network, view);
        let Some(state) = pbft_state(node) else { return };
        if view > state.view || (view < state.view && from == primary) {
            debug!("Ignoring pre-prepare for view {} (at {})", view, state.view);
            return;
        }
        if expected_primary.as_ref() != Some(primary) || block.producer_id != *primary {
            debug!("Ignoring pre-prepare from non-primary {}", primary);
            return;
        }
        if sequence < state.sequence {
            return;
        }
        let proof_matches = block.proof == BlockProof::Pbft { view, sequence };
        if !proof_matches || block.height != sequence || !block.has_consistent_id() {
            debug!("Ignoring malformed pre-prepare for sequence {}", sequence);
            return;
        }
        if let Some(logged) = state.pre_prepares.get(&sequence) {
            let superseded = proof_view(logged).map(|v| v < view).unwrap_or(true);
            if logged.id == block.id || !superseded || state.phase(sequence) == PbftPhase::Committed {
                return;
            }
            debug!("Sequence {} re-proposed in view {}", sequence, view);
            state.phases.remove(&sequence);
        }

        state.pre_prepares.insert(sequence, block.clone());
        state.advance(sequence, PbftPhase::PrePrepared);
        let id = node.id.clone();
        self.vote(node, Vote::Prepare, view, sequence, &block.id, &id);
        network.broadcast_all(
            &id,
            MessagePayload::PbftPrepare { view, sequence, block_id: block.id.clone(), sender: id.clone() },
            None,
        );
        self.check_prepared(node, sequence, network);
        // Commits may have arrived ahead of the proposal.
        self.check_committed(node, sequence, network);
    }

    fn vote(&self, node: &mut Node, kind: Vote, view: u64, sequence: u64, block_id: &str, sender: &NodeId) -> bool {
        let Some(state) = pbft_state(node) else { return false };
        if view > state.view || sequence < state.sequence {
            return false;
        }
        let votes = match kind {
            Vote::Prepare => &mut state.prepares,
            Vote::Commit => &mut state.commits,
        };
        votes
            .entry(sequence)
            .or_default()
            .entry(block_id.to_string())
            .or_default()
            .insert(sender.clone())
    }

    /// Votes matching the logged pre-prepare for `sequence`.
    fn tally(state: &PbftState, kind: Vote, sequence: u64) -> usize {
        let Some(block) = state.pre_prepares.get(&sequence) else { return 0 };
        let votes = match kind {
            Vote::Prepare => &state.prepares,
            Vote::Commit => &state.commits,
        };
        votes
            .get(&sequence)
            .and_then(|by_block| by_block.get(&block.id))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// This node's prepare for the logged block at `sequence`, plus its commit
    /// once prepared.
    fn own_votes(state: &PbftState, id: &NodeId, sequence: u64) -> Vec<MessagePayload> {
        let Some(block) = state.pre_prepares.get(&sequence) else { return Vec::new() };
        let view = proof_view(block).unwrap_or(state.view);
        let mut votes = vec![MessagePayload::PbftPrepare { view, sequence, block_id: block.id.clone(), sender: id.clone() }];
        if matches!(state.phase(sequence), PbftPhase::Prepared | PbftPhase::Committed) {
            votes.push(MessagePayload::PbftCommit { view, sequence, block_id: block.id.clone(), sender: id.clone() });
        }
        votes
    }

    /// Records and broadcasts this node's commit for the logged block at `sequence`.
    fn cast_commit(&self, node: &mut Node, sequence: u64, network: &mut Network) {
        let Some(state) = pbft_state_ref(node) else { return };
        let Some(block) = state.pre_prepares.get(&sequence) else { return };
        let view = proof_view(block).unwrap_or(state.view);
        let block_id = block.id.clone();
        let id = node.id.clone();

        self.vote(node, Vote::Commit, view, sequence, &block_id, &id);
        network.broadcast_all(
            &id,
            MessagePayload::PbftCommit { view, sequence, block_id, sender: id.clone() },
            None,
        );
    }

    fn check_prepared(&self, node: &mut Node, sequence: u64, network: &mut Network) {
        let quorum = bft_quorum(network.node_count());
        let Some(state) = pbft_state(node) else { return };
        if state.phase(sequence) != PbftPhase::PrePrepared || Self::tally(state, Vote::Prepare, sequence) < quorum {
            return;
        }
        state.advance(sequence, PbftPhase::Prepared);
        debug!("[{}] Sequence {} prepared", node.id, sequence);
        self.cast_commit(node, sequence, network);
        self.check_committed(node, sequence, network);
    }

    fn check_committed(&self, node: &mut Node, sequence: u64, network: &mut Network) {
        let quorum = bft_quorum(network.node_count());
        let Some(state) = pbft_state(node) else { return };
        if Self::tally(state, Vote::Commit, sequence) < quorum {
            return;
        }
        match state.phase(sequence) {
            PbftPhase::Prepared => {}
            PbftPhase::PrePrepared => {
                // 2f+1 commits mean a prepare quorum formed elsewhere.
                state.advance(sequence, PbftPhase::Prepared);
                debug!("[{}] Sequence {} certified by commits", node.id, sequence);
                self.cast_commit(node, sequence, network);
            }
            _ => return,
        }
        if let Some(state) = pbft_state(node) {
            state.advance(sequence, PbftPhase::Committed);
        }
        self.apply_committed(node);
    }

    /// Applies committed sequences in order, starting at the next expected one.
    fn apply_committed(&self, node: &mut Node) {
        loop {
            let Some(state) = pbft_state(node) else { return };
            let sequence = state.sequence;
            if state.phase(sequence) != PbftPhase::Committed {
                return;
            }
            let Some(block) = state.pre_prepares.get(&sequence).cloned() else { return };
            let view = proof_view(&block).unwrap_or(state.view);
            let block_id = block.id.clone();

            if !node.has_block(&block_id) && !node.add_block(block) {
                warn!("[{}] Cannot apply committed sequence {}: parent missing", node.id, sequence);
                return;
            }
            node.set_head(&block_id);
            node.set_finalized(&block_id);

            let Some(state) = pbft_state(node) else { return };
            state.sequence += 1;
            state.committed += 1;
            let next = state.sequence;
            state.prepares.retain(|seq, _| *seq >= next);
            state.commits.retain(|seq, _| *seq >= next);
            state.pre_prepares.retain(|seq, _| *seq >= next);

            info!("✅ [{}] Committed sequence {} in view {}", node.id, sequence, view);
            tracing::info!(target: "consensus", "EVENT:COMMIT node={} view={} seq={} block={}", node.id, view, sequence, block_id);
        }
    }

    /// Re-sends this node's votes for `sequence` at most once per proposal interval.
    fn resend_votes(&self, node: &mut Node, sequence: u64, network: &mut Network) {
        let now = network.now();
        let id = node.id.clone();
        let Some(state) = pbft_state(node) else { return };
        if now.saturating_sub(state.last_retransmit) < self.params.proposal_interval {
            return;
        }
        state.last_retransmit = now;
        for payload in Self::own_votes(state, &id, sequence) {
            network.broadcast_all(&id, payload, None);
        }
    }

    /// Answers a prepare for a sequence this node already committed with the
    /// block and this node's commit, so the sender can certify it.
    fn serve_committed(&self, node: &Node, sequence: u64, block_id: &str, to: &NodeId, network: &mut Network) {
        let Some(block) = node.block_at_height(sequence).filter(|b| b.id == block_id) else { return };
        let Some(view) = proof_view(block) else { return };
        debug!("[{}] Serving committed sequence {} to {}", node.id, sequence, to);
        network.send(
            &node.id,
            to,
            MessagePayload::PbftPrePrepare { view, sequence, block: block.clone(), primary: block.producer_id.clone() },
        );
        network.send(
            &node.id,
            to,
            MessagePayload::PbftCommit { view, sequence, block_id: block.id.clone(), sender: node.id.clone() },
        );
    }

    /// Timer-driven recovery from lost messages.
    fn retransmit(&self, node: &mut Node, is_primary: bool, now: u64, network: &mut Network) {
        let Some(state) = pbft_state_ref(node) else { return };
        let id = node.id.clone();
        let sequence = state.sequence;
        let primary = primary_for_view(network, state.view);

        let mut payloads = Vec::new();
        if let Some(block) = state.pre_prepares.get(&sequence) {
            if is_primary {
                let view = proof_view(block).unwrap_or(state.view);
                payloads.push(MessagePayload::PbftPrePrepare {
                    view,
                    sequence,
                    block: block.clone(),
                    primary: block.producer_id.clone(),
                });
            }
            payloads.extend(Self::own_votes(state, &id, sequence));
        } else if let Some((later, block)) = state.pre_prepares.range(sequence + 1..).next() {
            // Missing the next sequence: ask for the parent of the earliest one held.
            if let Some(parent_id) = block.parent_id.clone() {
                payloads.push(MessagePayload::PbftPrepare {
                    view: state.view,
                    sequence: later - 1,
                    block_id: parent_id,
                    sender: id.clone(),
                });
            }
        } else if is_primary && sequence > 1 {
            // Idle primary: repeat the last commit for replicas that missed it.
            if let Some(block) = node.block_at_height(sequence - 1) {
                if let Some(view) = proof_view(block) {
                    payloads.push(MessagePayload::PbftPrePrepare {
                        view,
                        sequence: sequence - 1,
                        block: block.clone(),
                        primary: block.producer_id.clone(),
                    });
                }
            }
        }

        let forward = if is_primary { Vec::new() } else { node.valid_pending_transactions(self.params.max_block_txs) };
        if let Some(state) = pbft_state(node) {
            state.last_retransmit = now;
        }

        for payload in payloads {
            network.broadcast_all(&id, payload, None);
        }
        if let Some(primary) = primary {
            for tx in forward {
                network.send(&id, &primary, MessagePayload::TxGossip { tx });
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Vote {
    Prepare,
    Commit,
}

impl ConsensusEngine for PbftEngine {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Pbft
    }

    fn params(&self) -> &ConsensusParams {
        &self.params
    }

    fn init(&self, node: &mut Node, network: &mut Network) {
        node.consensus_state = Some(ConsensusState::Pbft(PbftState {
            view: 0,
            sequence: node.finalized_height() + 1,
            last_proposal: network.now(),
            last_retransmit: network.now(),
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
            MessagePayload::PbftPrePrepare { view, sequence, block, primary } => {
                let Some(state) = pbft_state_ref(node) else { return };
                let repeated = state.pre_prepares.get(sequence).map(|b| b.id == block.id).unwrap_or(false);
                let from_primary = primary_for_view(network, state.view).as_ref() == Some(&msg.from);
                if repeated {
                    // The primary repeats a proposal while votes for it are missing.
                    if from_primary {
                        self.resend_votes(node, *sequence, network);
                    }
                } else {
                    self.accept_pre_prepare(node, *view, *sequence, block, primary, &msg.from, network);
                }
            }
            MessagePayload::PbftPrepare { view, sequence, block_id, sender } => {
                let committed = pbft_state_ref(node).map(|s| *sequence < s.sequence).unwrap_or(false);
                if committed {
                    self.serve_committed(node, *sequence, block_id, &msg.from, network);
                } else if self.vote(node, Vote::Prepare, *view, *sequence, block_id, sender) {
                    self.check_prepared(node, *sequence, network);
                }
            }
            MessagePayload::PbftCommit { view, sequence, block_id, sender } => {
                if self.vote(node, Vote::Commit, *view, *sequence, block_id, sender) {
                    self.check_committed(node, *sequence, network);
                }
            }
            _ => debug!("[{}] PBFT ignoring {}", node.id, msg.msg_type),
        }
    }

    fn on_tick(&self, node: &mut Node, now: u64, network: &mut Network) {
        let Some(state) = pbft_state_ref(node) else {
            error!("[{}] PBFT tick before init", node.id);
            return;
        };
        let is_primary = primary_for_view(network, state.view).as_ref() == Some(&node.id);
        let (last_proposal, last_retransmit) = (state.last_proposal, state.last_retransmit);

        if is_primary && now.saturating_sub(last_proposal) >= self.params.proposal_interval {
            self.propose(node, now, network);
        }
        if now.saturating_sub(last_retransmit) >= self.params.proposal_interval {
            self.retransmit(node, is_primary, now, network);
        }
    }

    fn role(&self, node: &Node) -> String {
        match pbft_state_ref(node) {
            Some(s) => format!("Replica (view {})", s.view),
            None => "Uninitialized".to_string(),
        }
    }

    fn role_with_network(&self, node: &Node, network: &Network) -> String {
        match pbft_state_ref(node) {
            Some(s) if primary_for_view(network, s.view).as_ref() == Some(&node.id) => "Primary".to_string(),
            Some(_) => "Replica".to_string(),
            None => self.role(node),
        }
    }

    fn ui_state(&self, node: &Node) -> serde_json::Value {
        let Some(s) = pbft_state_ref(node) else {
            return serde_json::Value::Null;
        };
        json!({
            "view": s.view,
            "sequence": s.sequence,
            "phase": s.phase(s.sequence),
            "prepares": Self::tally(s, Vote::Prepare, s.sequence),
            "commits": Self::tally(s, Vote::Commit, s.sequence),
            "committed": s.committed,
            "lastProposal": s.last_proposal,
            "proposalInterval": self.params.proposal_interval,
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
    use chainsim_common::TxState;

    fn engine() -> Arc<PbftEngine> {
        Arc::new(PbftEngine::new(ConsensusParams { proposal_interval: 500, ..Default::default() }))
    }

    #[test]
    fn test_primary_rotates_with_view() {
        let c = Cluster::new(4, engine());
        assert_eq!(primary_for_view(&c.network, 0), Some(Cluster::id(0)));
        assert_eq!(primary_for_view(&c.network, 1), Some(Cluster::id(1)));
        assert_eq!(primary_for_view(&c.network, 5), Some(Cluster::id(1)));
    }

    #[test]
    fn test_commits_on_every_replica() {
        let e = engine();
        let mut c = Cluster::new(4, e.clone());
        let tx = c.submit(2, "bob", 3, 0);
        c.run(30, 100);

        let head = c.node(0).head_id().to_string();
        for i in 0..4 {
            let n = c.node(i);
            assert_eq!(n.head_id(), head);
            assert_eq!(n.finalized_id(), head);
            assert_eq!(n.tx_state(&tx.id), Some(TxState::Finalized));
            assert_eq!(pbft_state_ref(n).unwrap().committed, 1);
        }
        assert_eq!(e.role_with_network(c.node(0), &c.network), "Primary");
        assert_eq!(e.role_with_network(c.node(1), &c.network), "Replica");
    }

    #[test]
    fn test_commit_needs_quorum() {
        let e = engine();
        let mut c = Cluster::new(4, e.clone());
        // Only the primary and one replica remain reachable: 2 < 2f+1 = 3.
        for i in 2..4 {
            let id = Cluster::id(i);
            c.network.unregister_node(&id);
            c.nodes.remove(&id);
        }
        c.network.register_node(Cluster::id(2));
        c.network.register_node(Cluster::id(3));

        let tx = c.submit(0, "bob", 3, 0);
        c.run(30, 100);

        let n = c.node(0);
        assert_eq!(n.finalized_height(), 0);
        assert_eq!(n.tx_state(&tx.id), Some(TxState::Pending));
        assert_eq!(pbft_state_ref(n).unwrap().phase(1), PbftPhase::PrePrepared);
    }

    #[test]
    fn test_commits_on_every_replica_despite_packet_loss() {
        let mut c = Cluster::new(4, engine());
        c.network.set_packet_loss(0.2);
        let txs: Vec<_> = (1..4).map(|i| c.submit(i, "bob", 2, 0)).collect();
        c.run(600, 100);

        let head = c.node(0).head_id().to_string();
        assert!(c.node(0).head_height() >= 1);
        for i in 0..4 {
            let n = c.node(i);
            assert_eq!(n.head_id(), head, "{}", n.id);
            assert_eq!(n.finalized_id(), head, "{}", n.id);
            for tx in &txs {
                assert_eq!(n.tx_state(&tx.id), Some(TxState::Finalized), "{} {}", n.id, tx.id);
            }
        }
    }

    #[test]
    fn test_lagging_replica_catches_up_from_committed_peers() {
        let mut c = Cluster::new(4, engine());
        let cut = Cluster::id(3);
        c.network.unregister_node(&cut);
        let tx = c.submit(0, "bob", 3, 0);
        c.run(30, 100);
        assert_eq!(c.node(0).finalized_height(), 1);
        assert_eq!(c.node(3).finalized_height(), 0);

        // Back online with nothing logged for sequence 1.
        c.network.register_node(cut);
        c.run(30, 100);

        let head = c.node(0).head_id().to_string();
        let n = c.node(3);
        assert_eq!(n.finalized_id(), head);
        assert_eq!(n.tx_state(&tx.id), Some(TxState::Finalized));
        assert_eq!(pbft_state_ref(n).unwrap().sequence, 2);
    }

    #[test]
    fn test_commit_certificate_completes_a_pre_prepared_sequence() {
        let mut c = Cluster::new(4, engine());
        let block = Block::new(&Block::genesis(), Cluster::id(0), 0, Vec::new(), BlockProof::Pbft { view: 0, sequence: 1 }, 5);
        let Cluster { nodes, network, .. } = &mut c;
        let e = engine();
        let node = nodes.get_mut(&Cluster::id(2)).unwrap();
        e.accept_pre_prepare(node, 0, 1, &block, &Cluster::id(0), &Cluster::id(0), network);
        assert_eq!(pbft_state_ref(node).unwrap().phase(1), PbftPhase::PrePrepared);

        for i in [0, 1, 3] {
            let sender = Cluster::id(i);
            assert!(e.vote(node, Vote::Commit, 0, 1, &block.id, &sender));
            e.check_committed(node, 1, network);
        }
        assert_eq!(node.finalized_id(), block.id);
        assert_eq!(pbft_state_ref(node).unwrap().sequence, 2);
    }

    #[test]
    fn test_view_change_moves_primary_and_drops_uncommitted() {
        let e = engine();
        let mut c = Cluster::new(4, e.clone());
        {
            let state = pbft_state(c.node_mut(0)).unwrap();
            state.phases.insert(1, PbftPhase::PrePrepared);
            state.pre_prepares.insert(1, Block::genesis());
        }
        let view = e.change_view(c.nodes.values_mut(), 900);
        assert_eq!(view, 1);
        for i in 0..4 {
            let s = pbft_state_ref(c.node(i)).unwrap();
            assert_eq!(s.view, 1);
            assert_eq!(s.last_proposal, 900);
            assert_eq!(s.last_retransmit, 900);
            assert!(s.pre_prepares.is_empty());
            assert_eq!(s.phase(1), PbftPhase::Idle);
        }
        assert_eq!(e.role_with_network(c.node(1), &c.network), "Primary");
    }
}
