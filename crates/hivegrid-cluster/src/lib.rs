//! hivegrid-cluster: keeping the hierarchy consistent when members crash.
//!
//! - [`heartbeat`]: UDP heartbeat announcer, receiver, and failure detector
//! - [`election`]: lease-based leader election over a [`Coordinator`]
//! - [`membership`]: join/fail tracking of group managers and local
//!   controllers against the repository

pub mod election;
pub mod error;
pub mod heartbeat;
pub mod membership;

pub use election::{
    Coordinator, ElectionListener, FileLeaseCoordinator, InMemoryCoordinator, LeaderElection, Role,
    StoreCoordinator,
};
pub use error::{ClusterError, ClusterResult};
pub use heartbeat::{
    HeartbeatAnnouncer, HeartbeatFailure, HeartbeatHandler, HeartbeatMessage, HeartbeatOutcome,
    HeartbeatReceiver,
};
pub use membership::{Member, MemberKind, MemberStatus, MembershipTracker};
