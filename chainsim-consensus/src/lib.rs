pub mod consensus;
pub mod engines;

pub use consensus::{create_engine, engine_from_name, ConsensusEngine, ConsensusParams};
pub use engines::{PbftEngine, PosEngine, PowEngine, RaftEngine};
