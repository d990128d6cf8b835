//! Migration pipeline error types.

use thiserror::Error;

use hive_core::VirtualMachineStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot {command} a vm that is {status}")]
    InvalidTransition {
        command: &'static str,
        status: VirtualMachineStatus,
    },
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("request to {address} failed: {reason}")]
    Request { address: String, reason: String },

    #[error("{address} rejected the command with status {status}")]
    Rejected { address: String, status: u16 },

    #[error("{address} did not answer in time")]
    Timeout { address: String },

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type ActuatorResult<T> = Result<T, ActuatorError>;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("virtual machine not found: {0}")]
    NotFound(String),

    #[error("virtual machine {0} is not hosted by any local controller")]
    NotHosted(String),

    #[error("local controller not found: {0}")]
    LocalControllerNotFound(String),

    #[error("{vm} started but could not be bound: {reason}")]
    Unbound { vm: String, reason: String },

    #[error("migration of {vm} did not complete: {reason}")]
    MigrationFailed { vm: String, reason: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("state store error: {0}")]
    State(#[from] hivegrid_state::StateError),
}

pub type MigrationResult<T> = Result<T, MigrationError>;
