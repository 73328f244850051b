use std::{fs, path::Path, str::FromStr, time::Duration};

use chainsim_common::{
    env::consensus::ConsensusKind,
    error::{ChainSimError, Result},
};
use chainsim_consensus::ConsensusParams;
use chainsim_p2p::NetworkConfig;
use serde::{Deserialize, Serialize};

/// Whole-simulation configuration, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// `pow`, `pos`, `raft` or `pbft`.
    pub consensus: String,
    pub node_count: usize,
    pub network: NetworkConfig,
    pub params: ConsensusParams,
    /// Simulated ms advanced per tick.
    pub tick_interval_ms: u64,
    /// Wall-clock speed multiplier for the driver.
    pub speed: f64,
    /// Genesis balance of every wallet.
    pub initial_balance: u64,
    /// Connect every node to every other; otherwise a ring.
    pub full_mesh: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            consensus: "pow".to_string(),
            node_count: 4,
            network: NetworkConfig::default(),
            params: ConsensusParams::default(),
            tick_interval_ms: 100,
            speed: 1.0,
            initial_balance: 1_000,
            full_mesh: true,
        }
    }
}

impl SimConfig {
    pub fn consensus_kind(&self) -> Result<ConsensusKind> {
        ConsensusKind::from_str(&self.consensus)
    }

    pub fn validate(&self) -> Result<()> {
        self.consensus_kind()?;
        if self.network.min_delay > self.network.max_delay {
            return Err(ChainSimError::Config(format!(
                "min_delay {} exceeds max_delay {}",
                self.network.min_delay, self.network.max_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.network.packet_loss) {
            return Err(ChainSimError::Config(format!(
                "packet_loss {} outside [0, 1]",
                self.network.packet_loss
            )));
        }
        if self.speed.is_nan() || self.speed <= 0.0 {
            return Err(ChainSimError::Config(format!("speed must be positive, got {}", self.speed)));
        }
        if self.tick_interval_ms == 0 {
            return Err(ChainSimError::Config("tick_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Wall-clock time between driver ticks.
    pub fn tick_interval(&self) -> Duration {
        let ms = (self.tick_interval_ms as f64 / self.speed).max(1.0);
        Duration::from_millis(ms as u64)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let parsed = serde_json::from_str::<SimConfig>(&data)?;
        Ok(parsed)
    }
}
