use chainsim_common::{NodeId, Transaction};
use chainsim_ledger::Node;
use chainsim_p2p::{MessagePayload, Network};
use tracing::debug;

/// Admits `tx` and, if it was new, forwards it to the node's peers except `from`.
///
/// Returns whether the transaction was admitted.
pub(crate) fn admit_and_gossip(
    node: &mut Node,
    tx: Transaction,
    network: &mut Network,
    from: Option<&NodeId>,
) -> bool {
    match node.admit_transaction(tx.clone()) {
        Ok(true) => {
            network.broadcast(&node.id, node.peers.iter(), MessagePayload::TxGossip { tx }, from);
            true
        }
        Ok(false) => false,
        Err(e) => {
            debug!("[{}] Rejected tx {}: {}", node.id, tx.id, e);
            false
        }
    }
}
