use crate::transfer::{
    pipeline::{PipelineError, StreamFault},
    transport::TransportError,
};
use std::io;
use thiserror::Error;

/// Why a single item did not succeed.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("stream corrupted: {0}")]
    Corrupt(#[from] PipelineError),

    #[error("local i/o failed: {0}")]
    Local(#[source] io::Error),
}

impl ItemError {
    /// Only transient transport failures are worth another attempt; corrupt
    /// data stays corrupt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ItemError::Transport(err) => err.is_retryable(),
            ItemError::Corrupt(_) | ItemError::Local(_) => false,
        }
    }
}

impl From<StreamFault> for ItemError {
    fn from(fault: StreamFault) -> Self {
        match fault {
            StreamFault::Transport(err) => ItemError::Transport(err),
            StreamFault::Corrupt(err) => ItemError::Corrupt(err),
        }
    }
}

/// Conditions that stop a whole batch.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("worker pool cannot be started: concurrency must be at least 1")]
    NoWorkers,

    #[error("worker task failed: {0}")]
    WorkerFailed(String),
}
