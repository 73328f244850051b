use std::path::PathBuf;

use clap::Parser;

use crate::config::SimConfig;

#[derive(Parser, Debug)]
#[command(name = "chainsim")]
#[command(about = "Discrete-time simulator for PoW, PoS, Raft and PBFT networks")]
pub struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// pow, pos, raft or pbft
    #[arg(long)]
    pub consensus: Option<String>,

    #[arg(short, long)]
    pub nodes: Option<usize>,

    /// Ticks to run before exiting
    #[arg(short, long, default_value_t = 300)]
    pub ticks: u64,

    /// Wall-clock speed multiplier (with --realtime)
    #[arg(long)]
    pub speed: Option<f64>,

    /// Packet loss probability in [0, 1]
    #[arg(long)]
    pub loss: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Write consensus audit events to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Pace ticks on the wall clock instead of running them back to back
    #[arg(long)]
    pub realtime: bool,

    /// Submit a transfer between rotating wallet pairs every N ticks (0 disables)
    #[arg(long, default_value_t = 20)]
    pub tx_every: u64,
}

impl Args {
    /// Applies command-line overrides on top of `base`.
    pub fn apply(&self, mut base: SimConfig) -> SimConfig {
        if let Some(consensus) = &self.consensus {
            base.consensus = consensus.clone();
        }
        if let Some(nodes) = self.nodes {
            base.node_count = nodes;
        }
        if let Some(speed) = self.speed {
            base.speed = speed;
        }
        if let Some(loss) = self.loss {
            base.network.packet_loss = loss;
        }
        if let Some(seed) = self.seed {
            base.network.seed = Some(seed);
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from(["chainsim", "--consensus", "raft", "-n", "7", "--loss", "0.2", "--seed", "9"]);
        let c = args.apply(SimConfig::default());
        assert_eq!(c.consensus, "raft");
        assert_eq!(c.node_count, 7);
        assert_eq!(c.network.packet_loss, 0.2);
        assert_eq!(c.network.seed, Some(9));
        assert_eq!(args.ticks, 300);
        assert!(!args.realtime);
    }
}
