//! hive-core: shared vocabulary for the HiveGrid control plane.
//!
//! Everything that more than one HiveGrid crate needs to agree on lives
//! here: identifiers and lifecycle statuses, the [`CapacityVector`] used by
//! every policy, the `hive.toml` configuration surface, and the event
//! types surfaced upward through the [`Notifier`].

pub mod capacity;
pub mod clock;
pub mod config;
pub mod duration;
pub mod events;
pub mod notifier;
pub mod types;

pub use capacity::CapacityVector;
pub use config::{ConfigError, HiveConfig};
pub use events::{Event, EventCategory, EventKind};
pub use notifier::Notifier;
pub use types::*;
