pub mod cli;
pub mod config;
pub mod runtime;
pub mod simulation;
pub mod snapshot;
pub mod wallet;

pub use config::SimConfig;
pub use runtime::driver::SimulationDriver;
pub use simulation::Simulation;
pub use snapshot::{NodeSnapshot, SimulationSnapshot};
pub use wallet::Wallet;
