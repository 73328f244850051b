use serde::{Deserialize, Serialize};

/// Global tunables. Every field falls back to the engine default when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// PoW: leading zero hex characters required in a block id.
    pub difficulty: usize,
    /// PoW: blocks (the block itself included) needed before it is final.
    pub confirmations: u64,
    /// PoW: nonce attempts per tick.
    pub hash_power: u64,
    pub max_block_txs: usize,
    /// PoS: slot length in ms.
    pub slot_duration: u64,
    /// PoS: fraction of total stake needed to finalize.
    pub stake_quorum: f64,
    pub default_stake: u64,
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    /// PBFT: minimum ms between primary proposals.
    pub proposal_interval: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            difficulty: 2,
            confirmations: 1,
            hash_power: 50,
            max_block_txs: 50,
            slot_duration: 2_000,
            stake_quorum: 2.0 / 3.0,
            default_stake: 100,
            election_timeout_min: 1_500,
            election_timeout_max: 3_000,
            heartbeat_interval: 500,
            proposal_interval: 1_500,
        }
    }
}
