use std::fmt;

use chainsim_common::{Block, NodeId, Transaction};
use serde::{Deserialize, Serialize};

/// Closed set of message kinds across all protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TxGossip,
    BlockPropose,
    BlockVote,
    RaftRequestVote,
    RaftVote,
    RaftAppendEntries,
    RaftAppendAck,
    RaftHeartbeat,
    PbftPrePrepare,
    PbftPrepare,
    PbftCommit,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::TxGossip => "TX_GOSSIP",
            MessageType::BlockPropose => "BLOCK_PROPOSE",
            MessageType::BlockVote => "BLOCK_VOTE",
            MessageType::RaftRequestVote => "RAFT_REQUEST_VOTE",
            MessageType::RaftVote => "RAFT_VOTE",
            MessageType::RaftAppendEntries => "RAFT_APPEND_ENTRIES",
            MessageType::RaftAppendAck => "RAFT_APPEND_ACK",
            MessageType::RaftHeartbeat => "RAFT_HEARTBEAT",
            MessageType::PbftPrePrepare => "PBFT_PRE_PREPARE",
            MessageType::PbftPrepare => "PBFT_PREPARE",
            MessageType::PbftCommit => "PBFT_COMMIT",
        };
        write!(f, "{}", s)
    }
}

/// Protocol payloads. The variant determines the message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    TxGossip {
        tx: Transaction,
    },
    BlockPropose {
        block: Block,
    },
    /// PoS attestation for a block proposed in `slot`.
    BlockVote {
        block_id: String,
        slot: u64,
        voter: NodeId,
        stake: u64,
    },
    RaftRequestVote {
        term: u64,
        candidate_id: NodeId,
        /// Chain height standing in for last log index/term.
        last_log_height: u64,
    },
    RaftVote {
        term: u64,
        vote_granted: bool,
        voter: NodeId,
    },
    RaftAppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_height: u64,
        prev_block_id: String,
        entries: Vec<Block>,
        leader_commit: u64,
    },
    RaftAppendAck {
        term: u64,
        success: bool,
        match_height: u64,
        follower: NodeId,
    },
    RaftHeartbeat {
        term: u64,
        leader_id: NodeId,
        leader_commit: u64,
        /// Id of the leader's block at `leader_commit`.
        commit_block_id: String,
    },
    PbftPrePrepare {
        view: u64,
        sequence: u64,
        block: Block,
        primary: NodeId,
    },
    PbftPrepare {
        view: u64,
        sequence: u64,
        block_id: String,
        sender: NodeId,
    },
    PbftCommit {
        view: u64,
        sequence: u64,
        block_id: String,
        sender: NodeId,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::TxGossip { .. } => MessageType::TxGossip,
            MessagePayload::BlockPropose { .. } => MessageType::BlockPropose,
            MessagePayload::BlockVote { .. } => MessageType::BlockVote,
            MessagePayload::RaftRequestVote { .. } => MessageType::RaftRequestVote,
            MessagePayload::RaftVote { .. } => MessageType::RaftVote,
            MessagePayload::RaftAppendEntries { .. } => MessageType::RaftAppendEntries,
            MessagePayload::RaftAppendAck { .. } => MessageType::RaftAppendAck,
            MessagePayload::RaftHeartbeat { .. } => MessageType::RaftHeartbeat,
            MessagePayload::PbftPrePrepare { .. } => MessageType::PbftPrePrepare,
            MessagePayload::PbftPrepare { .. } => MessageType::PbftPrepare,
            MessagePayload::PbftCommit { .. } => MessageType::PbftCommit,
        }
    }
}

/// A point-to-point message in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub from: NodeId,
    pub to: NodeId,
    pub payload: MessagePayload,
    pub created_at: u64,
    pub deliver_at: u64,
    pub total_delay: u64,
}

impl NetworkMessage {
    /// Fraction of the delay elapsed at `now`, clamped to `[0, 1]`.
    pub fn progress(&self, now: u64) -> f64 {
        if self.total_delay == 0 {
            return 1.0;
        }
        let elapsed = now.saturating_sub(self.created_at) as f64;
        (elapsed / self.total_delay as f64).min(1.0)
    }
}

/// Read-only view of an in-flight message for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub from: NodeId,
    pub to: NodeId,
    pub progress: f64,
    pub payload: MessagePayload,
}

impl MessageView {
    pub fn of(msg: &NetworkMessage, now: u64) -> Self {
        Self {
            id: msg.id,
            msg_type: msg.msg_type,
            from: msg.from.clone(),
            to: msg.to.clone(),
            progress: msg.progress(now),
            payload: msg.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(created_at: u64, total_delay: u64) -> NetworkMessage {
        let payload = MessagePayload::RaftVote { term: 1, vote_granted: true, voter: NodeId::from("a") };
        NetworkMessage {
            id: 1,
            msg_type: payload.message_type(),
            from: NodeId::from("a"),
            to: NodeId::from("b"),
            payload,
            created_at,
            deliver_at: created_at + total_delay,
            total_delay,
        }
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let m = msg(100, 200);
        assert_eq!(m.progress(100), 0.0);
        assert!((m.progress(200) - 0.5).abs() < f64::EPSILON);
        assert_eq!(m.progress(300), 1.0);
        assert_eq!(m.progress(10_000), 1.0);
        assert_eq!(m.progress(50), 0.0);

        let mut last = 0.0;
        for t in (100..=400).step_by(10) {
            let p = m.progress(t);
            assert!(p >= last);
            last = p;
        }
    }

    #[test]
    fn test_zero_delay_is_complete() {
        assert_eq!(msg(5, 0).progress(5), 1.0);
    }

    #[test]
    fn test_type_names_on_the_wire() {
        let payload = MessagePayload::PbftPrePrepare {
            view: 0,
            sequence: 1,
            block: Block::genesis(),
            primary: NodeId::from("a"),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "PBFT_PRE_PREPARE");
        assert_eq!(payload.message_type().to_string(), "PBFT_PRE_PREPARE");
        assert_eq!(serde_json::to_value(MessageType::RaftAppendAck).unwrap(), "RAFT_APPEND_ACK");
    }
}
