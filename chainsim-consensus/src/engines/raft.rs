//! Raft over blocks: chain height stands in for the log index and each block
//! produced by a leader is one log entry carrying that leader's term.
//!
//! Replication is optimistic. The leader appends locally first, then ships the
//! missing suffix to each follower from its `next_index`, backing off on
//! rejection. Commit follows the majority-acknowledged height, restricted to
//! blocks of the current term.

use std::any::Any;

use chainsim_common::{
    env::consensus::{ConsensusKind, ConsensusState, RaftRole, RaftState},
    Block, BlockProof, NodeId, Transaction,
};
use chainsim_ledger::Node;
use chainsim_p2p::{MessagePayload, Network, NetworkMessage};
use serde_json::json;
use tracing::{debug, error, info};

use super::gossip::admit_and_gossip;
use crate::consensus::{evaluator::is_majority, ConsensusEngine, ConsensusParams};

/// Upper bound on blocks shipped in one append-entries message.
const MAX_ENTRIES_PER_APPEND: usize = 16;

fn raft_state(node: &mut Node) -> Option<&mut RaftState> {
    node.consensus_state.as_mut().and_then(ConsensusState::as_raft_mut)
}

fn raft_state_ref(node: &Node) -> Option<&RaftState> {
    node.consensus_state.as_ref().and_then(ConsensusState::as_raft)
}

pub struct RaftEngine {
    params: ConsensusParams,
}

impl RaftEngine {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }

    fn random_timeout(&self, network: &mut Network) -> u64 {
        network.random_range(self.params.election_timeout_min, self.params.election_timeout_max)
    }

    /// Starts an election right away, regardless of the timer.
    pub fn force_election_timeout(&self, node: &mut Node, now: u64, network: &mut Network) {
        if raft_state_ref(node).map(|s| s.role == RaftRole::Leader).unwrap_or(true) {
            return;
        }
        self.start_election(node, now, network);
    }

    /// Adopts a higher term and falls back to follower.
    fn step_down(state: &mut RaftState, term: u64) {
        if term > state.term {
            state.term = term;
            state.voted_for = None;
        }
        state.role = RaftRole::Follower;
        state.votes_received.clear();
    }

    fn start_election(&self, node: &mut Node, now: u64, network: &mut Network) {
        let timeout = self.random_timeout(network);
        let last_log_height = node.head_height();
        let id = node.id.clone();
        let Some(state) = raft_state(node) else { return };

        state.term += 1;
        state.role = RaftRole::Candidate;
        state.voted_for = Some(id.clone());
        state.leader_id = None;
        state.votes_received.clear();
        state.votes_received.insert(id.clone());
        state.last_heartbeat = now;
        state.election_timeout = timeout;
        let term = state.term;

        info!("🗳️ [{}] Election timeout, starting election for term {}", id, term);
        tracing::info!(target: "consensus", "EVENT:ELECTION node={} term={}", id, term);

        if is_majority(1, network.node_count()) {
            self.become_leader(node, now, network);
            return;
        }
        network.broadcast_all(
            &id,
            MessagePayload::RaftRequestVote { term, candidate_id: id.clone(), last_log_height },
            None,
        );
    }

    fn become_leader(&self, node: &mut Node, now: u64, network: &mut Network) {
        let head_height = node.head_height();
        let id = node.id.clone();
        let peers = network.node_ids();
        let Some(state) = raft_state(node) else { return };

        state.role = RaftRole::Leader;
        state.leader_id = Some(id.clone());
        state.next_index.clear();
        state.match_index.clear();
        // Start from the committed prefix and let rejections walk it back further.
        let next = state.commit_index + 1;
        for peer in peers.into_iter().filter(|p| *p != id) {
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer, 0);
        }
        state.match_index.insert(id.clone(), head_height);
        let term = state.term;
        let uncommitted = head_height > state.commit_index;

        info!("👑 [{}] Became leader for term {}", id, term);
        tracing::info!(target: "consensus", "EVENT:LEADER node={} term={}", id, term);

        // Entries from earlier terms only commit under one of this term.
        if uncommitted {
            self.append_block(node, Vec::new(), now);
        }
        self.replicate(node, now, network);
    }

    /// Packages pending transactions into a block on the leader's own chain.
    fn append_local_block(&self, node: &mut Node, now: u64) {
        let txs = node.valid_pending_transactions(self.params.max_block_txs);
        if txs.is_empty() {
            return;
        }
        self.append_block(node, txs, now);
    }

    fn append_block(&self, node: &mut Node, txs: Vec<Transaction>, now: u64) {
        let Some(term) = raft_state_ref(node).map(|s| s.term) else { return };
        let block = Block::new(node.head(), node.id.clone(), term, txs, BlockProof::Raft { term }, now);
        let block_id = block.id.clone();
        let height = block.height;

        node.add_block(block);
        node.set_head(&block_id);
        let id = node.id.clone();
        if let Some(state) = raft_state(node) {
            state.match_index.insert(id.clone(), height);
        }
        info!("📦 [{}] Leader appended block {} at height {} (term {})", id, block_id, height, term);
    }

    /// One replication round: entries to lagging followers, heartbeats to the rest.
    fn replicate(&self, node: &mut Node, now: u64, network: &mut Network) {
        self.append_local_block(node, now);

        let head_id = node.head_id().to_string();
        let head_height = node.head_height();
        let Some(state) = raft_state_ref(node) else { return };
        let term = state.term;
        let leader_commit = state.commit_index;
        let commit_block_id = node
            .ancestor_at_height(&head_id, leader_commit)
            .map(|b| b.id.clone())
            .unwrap_or_else(|| node.finalized_id().to_string());

        for peer in network.node_ids() {
            if peer == node.id {
                continue;
            }
            let next = state.next_index.get(&peer).copied().unwrap_or(leader_commit + 1).clamp(1, head_height + 1);
            let payload = if next <= head_height {
                let prev_height = next - 1;
                let Some(prev) = node.ancestor_at_height(&head_id, prev_height) else { continue };
                let entries: Vec<Block> = node
                    .get_chain(&head_id)
                    .into_iter()
                    .skip(next as usize)
                    .take(MAX_ENTRIES_PER_APPEND)
                    .cloned()
                    .collect();
                MessagePayload::RaftAppendEntries {
                    term,
                    leader_id: node.id.clone(),
                    prev_height,
                    prev_block_id: prev.id.clone(),
                    entries,
                    leader_commit,
                }
            } else {
                MessagePayload::RaftHeartbeat {
                    term,
                    leader_id: node.id.clone(),
                    leader_commit,
                    commit_block_id: commit_block_id.clone(),
                }
            };
            network.send(&node.id, &peer, payload);
        }

        if let Some(state) = raft_state(node) {
            state.last_broadcast = now;
        }
        self.advance_commit(node, network);
    }

    /// Raises `commit_index` to the highest height a majority has matched.
    fn advance_commit(&self, node: &mut Node, network: &Network) {
        let ids = network.node_ids();
        let n = ids.len();
        if n == 0 {
            return;
        }
        let Some(state) = raft_state_ref(node) else { return };
        if state.role != RaftRole::Leader {
            return;
        }
        let mut matched: Vec<u64> = ids
            .iter()
            .map(|id| state.match_index.get(id).copied().unwrap_or(0))
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let majority_height = matched[n / 2];
        if majority_height <= state.commit_index {
            return;
        }
        let term = state.term;

        let head_id = node.head_id().to_string();
        let Some(block) = node.ancestor_at_height(&head_id, majority_height) else { return };
        if block.round != term {
            return;
        }
        let block_id = block.id.clone();

        if let Some(state) = raft_state(node) {
            state.commit_index = majority_height;
        }
        info!("📜 [{}] Commit index -> {} (term {})", node.id, majority_height, term);
        tracing::info!(target: "consensus", "EVENT:COMMIT node={} height={} term={}", node.id, majority_height, term);
        self.apply_commit(node, &block_id);
    }

    /// Finalizes `block_id` and everything below it.
    fn apply_commit(&self, node: &mut Node, block_id: &str) {
        if !node.has_block(block_id) {
            return;
        }
        if !node.is_ancestor(block_id, node.head_id()) {
            node.set_head(block_id);
        }
        node.set_finalized(block_id);
        let finalized_height = node.finalized_height();
        if let Some(state) = raft_state(node) {
            state.commit_index = state.commit_index.max(finalized_height);
            state.last_applied = finalized_height;
        }
    }

    /// Shared acceptance of a leader message. Returns false for a stale term.
    fn accept_leader(&self, node: &mut Node, term: u64, leader_id: &NodeId, now: u64) -> bool {
        let Some(state) = raft_state(node) else { return false };
        if term < state.term {
            return false;
        }
        Self::step_down(state, term);
        if state.leader_id.as_ref() != Some(leader_id) {
            info!("🤝 [{}] Following leader {} in term {}", node.id, leader_id, term);
        }
        let Some(state) = raft_state(node) else { return false };
        state.leader_id = Some(leader_id.clone());
        state.last_heartbeat = now;
        true
    }

    fn reject(&self, node: &Node, to: &NodeId, network: &mut Network) {
        let term = raft_state_ref(node).map(|s| s.term).unwrap_or(0);
        network.send(
            &node.id,
            to,
            MessagePayload::RaftAppendAck {
                term,
                success: false,
                match_height: node.finalized_height(),
                follower: node.id.clone(),
            },
        );
    }

    fn handle_request_vote(&self, node: &mut Node, term: u64, candidate: &NodeId, last_log_height: u64, network: &mut Network) {
        let head_height = node.head_height();
        let now = network.now();
        let id = node.id.clone();
        let Some(state) = raft_state(node) else { return };

        if term > state.term {
            Self::step_down(state, term);
            state.leader_id = None;
        }
        let free = state.voted_for.is_none() || state.voted_for.as_ref() == Some(candidate);
        let granted = term == state.term && free && last_log_height >= head_height;
        if granted {
            state.voted_for = Some(candidate.clone());
            state.last_heartbeat = now;
        }
        let reply_term = state.term;

        debug!("[{}] Vote for {} in term {}: {}", id, candidate, term, granted);
        network.send(
            &id,
            candidate,
            MessagePayload::RaftVote { term: reply_term, vote_granted: granted, voter: id.clone() },
        );
    }

    fn handle_vote(&self, node: &mut Node, term: u64, granted: bool, voter: &NodeId, network: &mut Network) {
        let Some(state) = raft_state(node) else { return };
        if term > state.term {
            Self::step_down(state, term);
            state.leader_id = None;
            return;
        }
        if state.role != RaftRole::Candidate || term != state.term || !granted {
            return;
        }
        state.votes_received.insert(voter.clone());
        if is_majority(state.votes_received.len(), network.node_count()) {
            let now = network.now();
            self.become_leader(node, now, network);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &self,
        node: &mut Node,
        term: u64,
        leader_id: &NodeId,
        prev_height: u64,
        prev_block_id: &str,
        entries: &[Block],
        leader_commit: u64,
        network: &mut Network,
    ) {
        let now = network.now();
        if !self.accept_leader(node, term, leader_id, now) {
            self.reject(node, leader_id, network);
            return;
        }

        let prev_matches = node.get_block(prev_block_id).map(|b| b.height == prev_height).unwrap_or(false);
        if !prev_matches {
            debug!("[{}] Missing entry at height {}, asking leader to back off", node.id, prev_height);
            self.reject(node, leader_id, network);
            return;
        }

        let mut tip = prev_block_id.to_string();
        for entry in entries {
            if entry.parent_id.as_deref() != Some(tip.as_str()) || !entry.has_consistent_id() {
                break;
            }
            node.add_block(entry.clone());
            tip = entry.id.clone();
        }
        if !node.is_ancestor(&tip, node.head_id()) {
            node.set_head(&tip);
        }
        let match_height = node.get_block(&tip).map(|b| b.height).unwrap_or(prev_height);

        let commit_to = leader_commit.min(match_height);
        if commit_to > node.finalized_height() {
            if let Some(id) = node.ancestor_at_height(&tip, commit_to).map(|b| b.id.clone()) {
                self.apply_commit(node, &id);
            }
        }

        let reply_term = raft_state_ref(node).map(|s| s.term).unwrap_or(term);
        network.send(
            &node.id,
            leader_id,
            MessagePayload::RaftAppendAck { term: reply_term, success: true, match_height, follower: node.id.clone() },
        );
    }

    fn handle_heartbeat(
        &self,
        node: &mut Node,
        term: u64,
        leader_id: &NodeId,
        leader_commit: u64,
        commit_block_id: &str,
        network: &mut Network,
    ) {
        let now = network.now();
        if !self.accept_leader(node, term, leader_id, now) {
            self.reject(node, leader_id, network);
            return;
        }
        if leader_commit > node.finalized_height() {
            let matches = node.get_block(commit_block_id).map(|b| b.height == leader_commit).unwrap_or(false);
            if matches {
                self.apply_commit(node, commit_block_id);
            } else {
                // Behind the committed prefix: make the leader resend from our last commit.
                self.reject(node, leader_id, network);
            }
        }
    }

    fn handle_append_ack(&self, node: &mut Node, term: u64, success: bool, match_height: u64, follower: &NodeId, network: &mut Network) {
        let Some(state) = raft_state(node) else { return };
        if term > state.term {
            Self::step_down(state, term);
            state.leader_id = None;
            return;
        }
        if state.role != RaftRole::Leader || term != state.term {
            return;
        }

        if success {
            let matched = state.match_index.entry(follower.clone()).or_insert(0);
            *matched = (*matched).max(match_height);
            state.next_index.insert(follower.clone(), match_height + 1);
            self.advance_commit(node, network);
        } else {
            let next = state.next_index.entry(follower.clone()).or_insert(1);
            *next = next.saturating_sub(1).min(match_height + 1).max(1);
            debug!("{} rejected append, next index -> {}", follower, *next);
        }
    }
}

impl ConsensusEngine for RaftEngine {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Raft
    }

    fn params(&self) -> &ConsensusParams {
        &self.params
    }

    fn init(&self, node: &mut Node, network: &mut Network) {
        let election_timeout = self.random_timeout(network);
        let commit_index = node.finalized_height();
        node.consensus_state = Some(ConsensusState::Raft(RaftState {
            role: RaftRole::Follower,
            election_timeout,
            last_heartbeat: network.now(),
            commit_index,
            last_applied: commit_index,
            ..Default::default()
        }));
    }

    /// Gossips to peers and also forwards straight to a known leader.
    fn on_tx(&self, node: &mut Node, tx: Transaction, network: &mut Network) -> bool {
        let admitted = admit_and_gossip(node, tx.clone(), network, None);
        if admitted {
            let leader = raft_state_ref(node).and_then(|s| s.leader_id.clone());
            if let Some(leader) = leader.filter(|l| *l != node.id && !node.peers.contains(l)) {
                network.send(&node.id, &leader, MessagePayload::TxGossip { tx });
            }
        }
        admitted
    }

    fn on_message(&self, node: &mut Node, msg: &NetworkMessage, network: &mut Network) {
        match &msg.payload {
            MessagePayload::TxGossip { tx } => {
                admit_and_gossip(node, tx.clone(), network, Some(&msg.from));
            }
            MessagePayload::RaftRequestVote { term, candidate_id, last_log_height } => {
                self.handle_request_vote(node, *term, candidate_id, *last_log_height, network)
            }
            MessagePayload::RaftVote { term, vote_granted, voter } => {
                self.handle_vote(node, *term, *vote_granted, voter, network)
            }
            MessagePayload::RaftAppendEntries { term, leader_id, prev_height, prev_block_id, entries, leader_commit } => self
                .handle_append_entries(node, *term, leader_id, *prev_height, prev_block_id, entries, *leader_commit, network),
            MessagePayload::RaftAppendAck { term, success, match_height, follower } => {
                self.handle_append_ack(node, *term, *success, *match_height, follower, network)
            }
            MessagePayload::RaftHeartbeat { term, leader_id, leader_commit, commit_block_id } => {
                self.handle_heartbeat(node, *term, leader_id, *leader_commit, commit_block_id, network)
            }
            _ => debug!("[{}] Raft ignoring {}", node.id, msg.msg_type),
        }
    }

    fn on_tick(&self, node: &mut Node, now: u64, network: &mut Network) {
        let Some(state) = raft_state_ref(node) else {
            error!("[{}] Raft tick before init", node.id);
            return;
        };
        match state.role {
            RaftRole::Leader => {
                if now.saturating_sub(state.last_broadcast) >= self.params.heartbeat_interval {
                    self.replicate(node, now, network);
                }
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if now.saturating_sub(state.last_heartbeat) >= state.election_timeout {
                    self.start_election(node, now, network);
                }
            }
        }
    }

    fn role(&self, node: &Node) -> String {
        raft_state_ref(node)
            .map(|s| s.role.to_string())
            .unwrap_or_else(|| "Uninitialized".to_string())
    }

    fn role_with_network(&self, node: &Node, _network: &Network) -> String {
        match raft_state_ref(node) {
            Some(s) => format!("{} (term {})", s.role, s.term),
            None => self.role(node),
        }
    }

    fn ui_state(&self, node: &Node) -> serde_json::Value {
        let Some(s) = raft_state_ref(node) else {
            return serde_json::Value::Null;
        };
        json!({
            "role": s.role.to_string(),
            "term": s.term,
            "votedFor": s.voted_for,
            "leaderId": s.leader_id,
            "electionTimeout": s.election_timeout,
            "lastHeartbeat": s.last_heartbeat,
            "votesReceived": s.votes_received.len(),
            "commitIndex": s.commit_index,
            "lastApplied": s.last_applied,
            "nextIndex": s.next_index,
            "matchIndex": s.match_index,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
