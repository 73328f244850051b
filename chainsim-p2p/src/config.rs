use serde::{Deserialize, Serialize};

fn default_min_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    800
}

/// Delivery characteristics of the simulated network. Delays are in simulated ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_min_delay")]
    pub min_delay: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
    /// Probability in `[0, 1]` that a message is silently dropped.
    #[serde(default)]
    pub packet_loss: f64,
    /// Seed for delay/drop/engine randomness. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            packet_loss: 0.0,
            seed: None,
        }
    }
}
