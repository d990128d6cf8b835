//! Cluster error types.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("heartbeat codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("coordinator unavailable: {0}")]
    Coordination(String),

    #[error("election gave up after {0} consecutive coordination failures")]
    ElectionAbandoned(u32),

    #[error("state store error: {0}")]
    State(#[from] hivegrid_state::StateError),
}
