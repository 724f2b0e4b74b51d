use std::time::Duration;

use thiserror::Error;

use hhsim::cli::{exit, UsageError};
use hhsim::error::{CommError, ConfigError, SimError};
use hhsim::output::OutputError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("{0}")]
    Usage(#[from] UsageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("bootstrap timed out after {after:?}: {joined} of {expected} workers joined")]
    Timeout {
        after: Duration,
        joined: usize,
        expected: usize,
    },

    #[error("rank 0 sent an unusable config: {0}")]
    Welcome(#[from] serde_json::Error),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("simulation thread failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::Usage(_)
            | DaemonError::Config(_)
            | DaemonError::Sim(SimError::Config(_)) => exit::USAGE,
            _ => exit::FAILURE,
        }
    }
}
