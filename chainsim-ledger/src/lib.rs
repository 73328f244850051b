//! Chain data model: ledger replay and the per-participant node state.

pub mod ledger;
pub mod node;

pub use ledger::Ledger;
pub use node::Node;
