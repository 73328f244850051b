use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ChainSimError;

/// The consensus protocol shared by the whole network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    Pow,
    Pos,
    Raft,
    Pbft,
}

impl FromStr for ConsensusKind {
    type Err = ChainSimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pow" | "proof-of-work" => Ok(ConsensusKind::Pow),
            "pos" | "proof-of-stake" => Ok(ConsensusKind::Pos),
            "raft" => Ok(ConsensusKind::Raft),
            "pbft" => Ok(ConsensusKind::Pbft),
            other => Err(ChainSimError::UnknownConsensus(other.to_string())),
        }
    }
}

impl fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsensusKind::Pow => "PoW",
            ConsensusKind::Pos => "PoS",
            ConsensusKind::Raft => "Raft",
            ConsensusKind::Pbft => "PBFT",
        };
        write!(f, "{}", s)
    }
}

/// Raft roles. One active role per node at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RaftRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaftRole::Follower => "Follower",
            RaftRole::Candidate => "Candidate",
            RaftRole::Leader => "Leader",
        };
        write!(f, "{}", s)
    }
}

/// Phases of a PBFT sequence number, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PbftPhase {
    #[default]
    Idle,
    PrePrepared,
    Prepared,
    Committed,
}

impl PbftPhase {
    /// The only phase a sequence may move to from `self`.
    pub fn next(self) -> Option<PbftPhase> {
        match self {
            PbftPhase::Idle => Some(PbftPhase::PrePrepared),
            PbftPhase::PrePrepared => Some(PbftPhase::Prepared),
            PbftPhase::Prepared => Some(PbftPhase::Committed),
            PbftPhase::Committed => None,
        }
    }
}
