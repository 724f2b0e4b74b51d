//! Error types for configuration, the process-group protocol and the run.

use thiserror::Error;

use crate::config::OwnerPolicy;
use crate::soma::SomaState;

pub type Result<T> = std::result::Result<T, SimError>;

/// Invalid run configuration. Raised before any simulation work starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("number of dendrites must be greater than 0")]
    NoDendrites,

    #[error("number of compartments must be greater than 0")]
    NoCompartments,

    #[error("steps per millisecond must be greater than 0")]
    NoSteps,

    #[error("simulated duration must be at least 1 ms")]
    NoDuration,

    #[error("initial soma state is not finite: {0:?}")]
    NonFiniteInitialState(SomaState),

    #[error("{policy:?} owner policy needs at least {required} processes, got {got}")]
    TooFewProcesses {
        policy: OwnerPolicy,
        required: usize,
        got: usize,
    },
}

/// Failure to exchange a protocol message. Always fatal for the whole group.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("peer {peer} disconnected")]
    Disconnected { peer: usize },

    #[error("rank {from} has no route to rank {to}")]
    NoRoute { from: usize, to: usize },

    #[error("unexpected message from rank {peer}: expected {expected}, got {got}")]
    Unexpected {
        peer: usize,
        expected: &'static str,
        got: String,
    },

    #[error("out-of-step message from rank {peer}: expected step {expected}, got {got}")]
    OutOfStep { peer: usize, expected: u64, got: u64 },

    #[error("assignment mismatch on rank {rank}: computed {computed:?}, granted {granted:?}")]
    AssignmentMismatch {
        rank: usize,
        computed: (usize, usize),
        granted: (usize, usize),
    },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("communication error: {0}")]
    Comm(#[from] CommError),

    #[error("simulation diverged at fine step {step}: soma state {state:?} is not finite")]
    Divergence { step: u64, state: SomaState },

    #[error("rank {rank} aborted the run: {reason}")]
    PeerAborted { rank: usize, reason: String },

    #[error("rank {rank} panicked")]
    Panicked { rank: usize },
}

impl SimError {
    /// Whether this error was caused by another process failing first.
    pub fn is_secondary(&self) -> bool {
        matches!(
            self,
            SimError::PeerAborted { .. } | SimError::Comm(CommError::Disconnected { .. })
        )
    }
}
