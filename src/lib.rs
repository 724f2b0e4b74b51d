//! Multi-compartment Hodgkin-Huxley neuron simulator.
//!
//! One active soma is driven by a set of passive dendrites, each a chain of
//! compartments whose tip receives a noisy injected current. Dendrites are
//! split across a process group; rank 0 owns the soma and the result series,
//! and every fine step is a strict reduce-then-broadcast barrier.

#[path = "core/rk4.rs"]
pub mod rk4;

#[path = "core/soma.rs"]
pub mod soma;

#[path = "core/dendrite.rs"]
pub mod dendrite;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/assignment.rs"]
pub mod assignment;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/comm.rs"]
pub mod comm;

#[path = "core/coordinator.rs"]
pub mod coordinator;

#[path = "core/results.rs"]
pub mod results;

#[path = "core/error.rs"]
pub mod error;

pub mod cli;
pub mod observer;
pub mod output;

pub mod prelude {
    pub use crate::assignment::{Assignment, SOMA_OWNER};
    pub use crate::comm::{Communicator, LocalEndpoint, LocalGroup, Message};
    pub use crate::config::{OwnerPolicy, SimConfig};
    pub use crate::coordinator::{simulate_local, Coordinator, Phase, ProcessOutcome};
    pub use crate::error::{CommError, ConfigError, SimError};
    pub use crate::observer::{NullObserver, ProgressObserver, RunSnapshot, SimObserver};
    pub use crate::results::{ResultSeries, RunReport};
    pub use crate::soma::SomaState;
}
