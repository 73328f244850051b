use chainsim_common::{crypto::digest, NodeId};
use serde::{Deserialize, Serialize};

/// A funded address bound to the node it submits through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: String,
    pub address: String,
    pub node_id: NodeId,
    /// Nonce for the next transaction; advances only on admission.
    pub next_nonce: u64,
}

impl Wallet {
    pub fn new(id: impl Into<String>, node_id: NodeId) -> Self {
        let id = id.into();
        Self {
            address: Self::derive_address(&id),
            id,
            node_id,
            next_nonce: 0,
        }
    }

    /// `0x` followed by the first 40 hex chars of the id digest.
    pub fn derive_address(id: &str) -> String {
        let hash = digest(format!("wallet:{}", id).as_bytes());
        format!("0x{}", &hash[..40])
    }
}
