//! Shared types for the chain simulator: identifiers, hashing, transactions,
//! blocks and the per-protocol consensus state carried by every node.

pub mod block;
pub mod crypto;
pub mod env;
pub mod error;
pub mod genesis;
pub mod transactions;
pub mod utils;

pub use block::{Block, BlockProof};
pub use error::{ChainSimError, Result};
pub use transactions::{Transaction, TxState};
pub use utils::NodeId;

/// Account address. Wallet addresses double as the (fake) signing key.
pub type Address = String;
