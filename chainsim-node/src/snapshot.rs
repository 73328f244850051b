//! Read-only views handed to display layers.

use std::collections::BTreeMap;

use chainsim_common::NodeId;
use chainsim_p2p::{MessageView, NetworkStats};
use serde::Serialize;

use crate::wallet::Wallet;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub position: (f64, f64),
    pub head_id: String,
    pub head_height: u64,
    pub finalized_id: String,
    pub finalized_height: u64,
    pub mempool_size: usize,
    pub role: String,
    pub peers: Vec<NodeId>,
    /// Protocol-specific counters.
    pub ui: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    #[serde(flatten)]
    pub wallet: Wallet,
    /// Balance as seen by the wallet's node on its head chain.
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSnapshot {
    pub now: u64,
    pub consensus: String,
    pub nodes: Vec<NodeSnapshot>,
    pub messages: Vec<MessageView>,
    pub wallets: BTreeMap<String, WalletSnapshot>,
    pub network: NetworkStats,
}
