//! utils.rs
//!
//! Common types and helper implementations shared across the simulator.

pub mod node_id;
pub use node_id::NodeId;
