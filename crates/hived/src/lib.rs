//! hived: a HiveGrid group manager node.
//!
//! [`Node`] wires the HiveGrid crates into one process: redb state store,
//! resource demand estimator, placement and relocation policies, migration
//! pipeline, heartbeats, leader election and the group manager loops.
//! [`Seed`] loads local controllers and VM submissions into a store.

pub mod duties;
pub mod node;
pub mod seed;

pub use node::{GROUP_LEADER_LEASE, Node, coordinator_for, store_path};
pub use seed::{Seed, SeedReport};
