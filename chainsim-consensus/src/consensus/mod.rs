//! consensus.rs
//!
//! The shared contract every protocol implements, and the factory that turns
//! a configured protocol name into an engine.
//!
//! One engine instance serves the whole network: it holds behavior and shared
//! tunables, while each node carries its own `ConsensusState`.

mod engine;
pub mod evaluator;
mod params;

use std::{str::FromStr, sync::Arc};

use chainsim_common::{env::consensus::ConsensusKind, error::Result};

pub use engine::ConsensusEngine;
pub use params::ConsensusParams;

use crate::engines::{PbftEngine, PosEngine, PowEngine, RaftEngine};

pub fn create_engine(kind: ConsensusKind, params: ConsensusParams) -> Arc<dyn ConsensusEngine> {
    match kind {
        ConsensusKind::Pow => Arc::new(PowEngine::new(params)),
        ConsensusKind::Pos => Arc::new(PosEngine::new(params)),
        ConsensusKind::Raft => Arc::new(RaftEngine::new(params)),
        ConsensusKind::Pbft => Arc::new(PbftEngine::new(params)),
    }
}

/// Fails with `UnknownConsensus` when `name` is not a supported protocol.
pub fn engine_from_name(name: &str, params: ConsensusParams) -> Result<Arc<dyn ConsensusEngine>> {
    let kind = ConsensusKind::from_str(name)?;
    Ok(create_engine(kind, params))
}
