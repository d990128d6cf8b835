//! hivegrid-migration: turning plans into hypervisor actions.
//!
//! - [`lifecycle`]: which commands are legal in which VM status
//! - [`actuator`]: the capability that talks to local controllers
//! - [`worker`]: one task per migration, bounded by a timeout
//! - [`enforcer`]: runs every directive of a plan concurrently and commits
//!   the successful ones to the repository
//! - [`controller`]: single VM lifecycle commands

pub mod actuator;
pub mod controller;
pub mod enforcer;
pub mod error;
pub mod lifecycle;
pub mod request;
pub mod worker;

pub use actuator::{HttpActuator, SimulatedActuator, VirtualMachineActuator};
pub use controller::VirtualMachineController;
pub use enforcer::{EnforcementReport, MIGRATION_NOT_COMMITTED, MigrationOutcome, PlanEnforcer};
pub use error::{ActuatorError, ActuatorResult, LifecycleError, MigrationError, MigrationResult};
pub use lifecycle::VirtualMachineCommand;
pub use request::MigrationRequest;
pub use worker::{MigrationListener, MigrationWorker};
