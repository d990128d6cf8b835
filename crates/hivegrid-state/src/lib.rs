//! hivegrid-state: the repository the control plane plans against.
//!
//! The [`Repository`] trait is the only way policies, enforcers, and
//! background loops read or mutate cluster state. [`StateStore`] implements
//! it on top of [redb](https://docs.rs/redb), with an in-memory backend for
//! tests.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by entity id. Monitoring history is embedded in each record as a
//! bounded, timestamp-ordered map and trimmed on every insert.
//!
//! Mutations that touch more than one record (assigning a VM to a local
//! controller, committing a migration) run in a single write transaction so
//! a VM is never owned by two controllers, or by none.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use repository::Repository;
pub use store::StateStore;
pub use types::*;
