mod gossip;
pub mod pbft;
pub mod pos;
pub mod pow;
pub mod raft;

pub use pbft::PbftEngine;
pub use pos::PosEngine;
pub use pow::PowEngine;
pub use raft::RaftEngine;

#[cfg(test)]
pub(crate) mod testkit;
