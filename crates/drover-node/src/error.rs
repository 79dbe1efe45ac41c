use drover_cas::CasError;
use thiserror::Error;

/// Errors surfaced by the node's loops and start-up.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Cache error: {0}")]
    Cas(#[from] CasError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, NodeError>;
