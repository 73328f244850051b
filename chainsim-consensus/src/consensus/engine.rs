use std::any::Any;

use chainsim_common::{env::consensus::ConsensusKind, NodeId, Transaction};
use chainsim_ledger::Node;
use chainsim_p2p::{Network, NetworkMessage};

use super::params::ConsensusParams;

/// Capability set shared by PoW, PoS, Raft and PBFT.
///
/// Engines mutate the node they are handed and may enqueue messages on the
/// network; they never touch another node directly.
pub trait ConsensusEngine: Send + Sync {
    fn kind(&self) -> ConsensusKind;

    fn params(&self) -> &ConsensusParams;

    /// Allocates and attaches this node's consensus state.
    fn init(&self, node: &mut Node, network: &mut Network);

    /// Accepts a freshly submitted transaction. Returns whether it was admitted.
    fn on_tx(&self, node: &mut Node, tx: Transaction, network: &mut Network) -> bool;

    /// Handles a delivered message. Unknown types are ignored.
    fn on_message(&self, node: &mut Node, msg: &NetworkMessage, network: &mut Network);

    /// Background work, run once per node per global tick.
    fn on_tick(&self, node: &mut Node, now: u64, network: &mut Network);

    /// Display label only.
    fn role(&self, node: &Node) -> String;

    fn role_with_network(&self, node: &Node, _network: &Network) -> String {
        self.role(node)
    }

    /// True iff `block_id` is the finalized block or one of its ancestors.
    fn is_finalized(&self, node: &Node, block_id: &str) -> bool {
        node.is_ancestor(block_id, node.finalized_id())
    }

    /// Read-only snapshot of protocol counters for display.
    fn ui_state(&self, node: &Node) -> serde_json::Value;

    /// Called after a node leaves the simulation.
    fn on_node_removed(&self, _id: &NodeId) {}

    fn as_any(&self) -> &dyn Any;
}
