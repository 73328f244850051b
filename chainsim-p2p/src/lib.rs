pub mod config;
pub mod message;
pub mod network;

pub use config::NetworkConfig;
pub use message::{MessagePayload, MessageType, MessageView, NetworkMessage};
pub use network::{BroadcastReport, Network, NetworkStats, SendOutcome};
