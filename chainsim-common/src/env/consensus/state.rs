//! Per-node consensus state, one variant per protocol.
//!
//! Engines own the contents; everything else treats it as opaque.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::types::{ConsensusKind, PbftPhase, RaftRole};
use crate::{block::Block, utils::NodeId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowState {
    pub mining: bool,
    /// Nonce attempts per tick.
    pub hash_power: u64,
    /// Random per-node starting offset so miners search disjoint nonce ranges.
    pub native_nonce: u64,
    /// Attempts made against the current candidate height.
    pub current_nonce: u64,
    pub mining_height: u64,
    pub last_block_time: u64,
    pub block_just_mined: bool,
    pub blocks_mined: u64,
    pub total_hashes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PosState {
    pub is_validator: bool,
    pub stake: u64,
    /// Block id -> voters
    pub votes: HashMap<String, BTreeSet<NodeId>>,
    pub voted_slots: BTreeSet<u64>,
    /// Tentatively adopted blocks not finalized yet.
    pub pending_blocks: BTreeSet<String>,
    pub current_slot: Option<u64>,
    pub blocks_proposed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftState {
    pub role: RaftRole,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub election_timeout: u64,
    /// Last time a heartbeat/append was accepted, or an election started.
    pub last_heartbeat: u64,
    /// Last time this node, as leader, sent a replication round.
    pub last_broadcast: u64,
    pub next_index: BTreeMap<NodeId, u64>,
    pub match_index: BTreeMap<NodeId, u64>,
    pub votes_received: BTreeSet<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// Votes per sequence: sequence -> block id -> voters.
pub type PbftVotes = BTreeMap<u64, BTreeMap<String, BTreeSet<NodeId>>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PbftState {
    pub view: u64,
    /// Next sequence number to commit.
    pub sequence: u64,
    pub phases: BTreeMap<u64, PbftPhase>,
    pub pre_prepares: BTreeMap<u64, Block>,
    pub prepares: PbftVotes,
    pub commits: PbftVotes,
    pub last_proposal: u64,
    /// Last time this node re-sent its proposal or votes.
    pub last_retransmit: u64,
    pub committed: u64,
}

impl PbftState {
    pub fn phase(&self, sequence: u64) -> PbftPhase {
        self.phases.get(&sequence).copied().unwrap_or_default()
    }

    /// Moves `sequence` to `to` only if `to` is its immediate successor.
    pub fn advance(&mut self, sequence: u64, to: PbftPhase) -> bool {
        if self.phase(sequence).next() == Some(to) {
            self.phases.insert(sequence, to);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ConsensusState {
    Pow(PowState),
    Pos(PosState),
    Raft(RaftState),
    Pbft(PbftState),
}

impl ConsensusState {
    pub fn kind(&self) -> ConsensusKind {
        match self {
            ConsensusState::Pow(_) => ConsensusKind::Pow,
            ConsensusState::Pos(_) => ConsensusKind::Pos,
            ConsensusState::Raft(_) => ConsensusKind::Raft,
            ConsensusState::Pbft(_) => ConsensusKind::Pbft,
        }
    }

    pub fn as_pow_mut(&mut self) -> Option<&mut PowState> {
        match self {
            ConsensusState::Pow(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pos_mut(&mut self) -> Option<&mut PosState> {
        match self {
            ConsensusState::Pos(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_raft_mut(&mut self) -> Option<&mut RaftState> {
        match self {
            ConsensusState::Raft(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pbft_mut(&mut self) -> Option<&mut PbftState> {
        match self {
            ConsensusState::Pbft(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pow(&self) -> Option<&PowState> {
        match self {
            ConsensusState::Pow(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pos(&self) -> Option<&PosState> {
        match self {
            ConsensusState::Pos(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_raft(&self) -> Option<&RaftState> {
        match self {
            ConsensusState::Raft(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pbft(&self) -> Option<&PbftState> {
        match self {
            ConsensusState::Pbft(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pbft_advance_in_order_only() {
        let mut s = PbftState::default();
        assert_eq!(s.phase(1), PbftPhase::Idle);
        assert!(!s.advance(1, PbftPhase::Prepared));
        assert!(s.advance(1, PbftPhase::PrePrepared));
        assert!(!s.advance(1, PbftPhase::PrePrepared));
        assert!(s.advance(1, PbftPhase::Prepared));
        assert!(s.advance(1, PbftPhase::Committed));
        assert!(!s.advance(1, PbftPhase::Idle));
        assert_eq!(s.phase(1), PbftPhase::Committed);
    }

    #[test]
    fn test_variant_accessors() {
        let mut st = ConsensusState::Raft(RaftState::default());
        assert_eq!(st.kind(), ConsensusKind::Raft);
        assert!(st.as_raft_mut().is_some());
        assert!(st.as_pow_mut().is_none());
    }
}
