//! In-memory collaborators and a simulation harness.
//!
//! Available to this crate's tests and, with the `test-utils` feature, to
//! other crates and devnets.

mod executor;
mod keys;
mod ledger;
mod network;
mod pool;
mod sim;
mod subset;

pub use executor::DeterministicExecutor;
pub use keys::MockKeyShare;
pub use ledger::MemoryLedger;
pub use network::{Envelope, LocalNetwork, LocalTransport};
pub use pool::MemoryPool;
pub use sim::{genesis, SimNode, Simulation, SimulationBuilder};
pub use subset::LocalSubset;
