//! Manager error types.

use thiserror::Error;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown anomaly detector: {0}")]
    UnknownDetector(String),

    #[error("local controller not found: {0}")]
    LocalControllerNotFound(String),

    #[error("migration error: {0}")]
    Migration(#[from] hivegrid_migration::MigrationError),

    #[error("state store error: {0}")]
    State(#[from] hivegrid_state::StateError),
}
