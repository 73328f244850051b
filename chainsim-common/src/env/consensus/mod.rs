pub mod state;
pub mod types;

pub use state::{ConsensusState, PbftState, PosState, PowState, RaftState};
pub use types::{ConsensusKind, PbftPhase, RaftRole};
