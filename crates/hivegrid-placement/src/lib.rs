//! hivegrid-placement: the decision policies of the HiveGrid control plane.
//!
//! Every policy reads repository snapshots, asks the
//! [`ResourceDemandEstimator`](hivegrid_estimator::ResourceDemandEstimator)
//! for capacity vectors, and returns an immutable plan. Plans are enforced
//! elsewhere; nothing in this crate mutates cluster state.
//!
//! - [`placement`]: new VMs onto local controllers
//! - [`reconfiguration`]: periodic consolidation onto fewer controllers
//! - [`relocation`]: relieve an overloaded or evacuate an underloaded controller
//! - [`dispatching`]: submissions onto group managers (group leader)
//! - [`submission`]: split a submission into bound and free VMs

pub mod cursor;
pub mod dispatching;
pub mod ledger;
pub mod placement;
pub mod plan;
pub mod reconfiguration;
pub mod relocation;
pub mod submission;

pub use dispatching::DispatchingPolicy;
pub use placement::PlacementPolicy;
pub use plan::{
    DispatchingPlan, MigrationPlan, PlacementPlan, ReconfigurationPlan, RelocationDirective,
};
pub use reconfiguration::ReconfigurationPolicy;
pub use relocation::{RelocationKind, RelocationPolicy};
pub use submission::{SubmissionSplit, split_submission};
