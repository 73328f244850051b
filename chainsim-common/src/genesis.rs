use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Synthetic id shared by every node's height-0 block.
pub const GENESIS_ID: &str = "0000000000000000000000000000000000000000000000000000000000000000";
pub const GENESIS_PRODUCER: &str = "genesis";

/// Externally seeded balances the ledger replays on top of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Address -> amount
    pub allocations: BTreeMap<String, u64>,
}

impl GenesisState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocation(mut self, address: &str, amount: u64) -> Self {
        self.allocations.insert(address.to_string(), amount);
        self
    }
}
