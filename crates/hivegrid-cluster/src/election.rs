//! Leader election over a lease-granting coordinator.
//!
//! Every candidate campaigns once per renew interval. The coordinator
//! grants a lease to one candidate at a time; the holder renews it by
//! campaigning again. When the leader stops renewing, its lease expires
//! and the next campaign from a follower wins.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use hive_core::clock::epoch_millis;
use hive_core::config::ElectionConfig;
use hivegrid_state::{StateResult, StateStore};

use crate::error::{ClusterError, ClusterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Leader,
}

/// The distributed coordination primitive behind an election.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Take or renew the lease for `candidate`. Returns whether the
    /// candidate holds it afterwards.
    async fn campaign(&self, candidate: &str, lease: Duration) -> ClusterResult<bool>;

    /// Give up the lease if `candidate` holds it.
    async fn resign(&self, candidate: &str) -> ClusterResult<()>;

    async fn current_leader(&self) -> ClusterResult<Option<String>>;
}

#[derive(Default)]
struct LeaseSlot {
    holder: Option<(String, Instant)>,
    unreachable: bool,
}

/// Process-local coordinator. Clones share one lease.
#[derive(Clone, Default)]
pub struct InMemoryCoordinator {
    slot: Arc<Mutex<LeaseSlot>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as if the coordination service were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.unreachable = unreachable;
        }
    }

    fn reachable(&self) -> ClusterResult<MutexGuard<'_, LeaseSlot>> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| ClusterError::Coordination("lease table poisoned".to_string()))?;
        if slot.unreachable {
            return Err(ClusterError::Coordination("coordinator unreachable".to_string()));
        }
        Ok(slot)
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn campaign(&self, candidate: &str, lease: Duration) -> ClusterResult<bool> {
        let mut slot = self.reachable()?;
        let now = Instant::now();
        let held_by_other = matches!(
            &slot.holder,
            Some((holder, expires)) if holder != candidate && *expires > now
        );
        if held_by_other {
            return Ok(false);
        }
        slot.holder = Some((candidate.to_string(), now + lease));
        Ok(true)
    }

    async fn resign(&self, candidate: &str) -> ClusterResult<()> {
        let mut slot = self.reachable()?;
        if matches!(&slot.holder, Some((holder, _)) if holder == candidate) {
            slot.holder = None;
        }
        Ok(())
    }

    async fn current_leader(&self) -> ClusterResult<Option<String>> {
        let slot = self.reachable()?;
        let now = Instant::now();
        Ok(slot
            .holder
            .as_ref()
            .filter(|(_, expires)| *expires > now)
            .map(|(holder, _)| holder.clone()))
    }
}

/// Coordinator backed by a lease row in the state store.
#[derive(Clone)]
pub struct StoreCoordinator {
    store: StateStore,
    name: String,
}

impl StoreCoordinator {
    pub fn new(store: StateStore, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Coordinator for StoreCoordinator {
    async fn campaign(&self, candidate: &str, lease: Duration) -> ClusterResult<bool> {
        let granted = self.store.acquire_lease(
            &self.name,
            candidate,
            lease.as_millis() as u64,
            epoch_millis(),
        )?;
        Ok(granted.holder == candidate)
    }

    async fn resign(&self, candidate: &str) -> ClusterResult<()> {
        self.store.release_lease(&self.name, candidate)?;
        Ok(())
    }

    async fn current_leader(&self) -> ClusterResult<Option<String>> {
        let now = epoch_millis();
        Ok(self
            .store
            .get_lease(&self.name)?
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.holder))
    }
}

const LEASE_FILE_ATTEMPTS: u32 = 20;
const LEASE_FILE_BACKOFF: Duration = Duration::from_millis(25);

/// Coordinator on a lease file every candidate can open, e.g. on a shared
/// volume. The file is opened for a single call and closed again, so
/// candidates in other processes take turns on it.
#[derive(Clone)]
pub struct FileLeaseCoordinator {
    path: PathBuf,
    name: String,
}

impl FileLeaseCoordinator {
    pub fn new(path: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            path: path.into(),
            name: name.to_string(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Run `op` against the lease file, retrying while another candidate
    /// has it open.
    async fn with_file<T>(&self, op: impl Fn(&StateStore) -> StateResult<T> + Send + Sync) -> ClusterResult<T> {
        let mut last_error = String::new();
        for attempt in 1..=LEASE_FILE_ATTEMPTS {
            match StateStore::open(&self.path) {
                Ok(store) => return Ok(op(&store)?),
                Err(e) => {
                    debug!(path = ?self.path, attempt, error = %e, "lease file busy");
                    last_error = e.to_string();
                }
            }
            tokio::time::sleep(LEASE_FILE_BACKOFF).await;
        }
        Err(ClusterError::Coordination(format!(
            "lease file {}: {last_error}",
            self.path.display()
        )))
    }
}

#[async_trait]
impl Coordinator for FileLeaseCoordinator {
    async fn campaign(&self, candidate: &str, lease: Duration) -> ClusterResult<bool> {
        let lease_ms = lease.as_millis() as u64;
        let granted = self
            .with_file(|store| store.acquire_lease(&self.name, candidate, lease_ms, epoch_millis()))
            .await?;
        Ok(granted.holder == candidate)
    }

    async fn resign(&self, candidate: &str) -> ClusterResult<()> {
        self.with_file(|store| store.release_lease(&self.name, candidate))
            .await?;
        Ok(())
    }

    async fn current_leader(&self) -> ClusterResult<Option<String>> {
        let lease = self.with_file(|store| store.get_lease(&self.name)).await?;
        let now = epoch_millis();
        Ok(lease
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.holder))
    }
}

pub trait ElectionListener: Send + Sync {
    fn on_elected(&self);
    fn on_demoted(&self);
}

pub struct LeaderElection {
    coordinator: Arc<dyn Coordinator>,
    candidate: String,
    lease: Duration,
    renew_interval: Duration,
    max_consecutive_failures: u32,
    listeners: Vec<Arc<dyn ElectionListener>>,
    role: watch::Sender<Role>,
}

impl LeaderElection {
    pub fn new(coordinator: Arc<dyn Coordinator>, candidate: &str, config: &ElectionConfig) -> Self {
        let (role, _) = watch::channel(Role::Follower);
        Self {
            coordinator,
            candidate: candidate.to_string(),
            lease: config.lease(),
            renew_interval: config.renew_interval(),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            listeners: Vec::new(),
            role,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ElectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    /// Startup check. An error here should abort the process.
    pub async fn check_connectivity(&self) -> ClusterResult<Option<String>> {
        let leader = self.coordinator.current_leader().await?;
        debug!(candidate = %self.candidate, ?leader, "coordinator reachable");
        Ok(leader)
    }

    /// Campaign until shutdown. Resigns on the way out if leading.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ClusterResult<()> {
        let mut failures = 0u32;
        info!(candidate = %self.candidate, lease = ?self.lease, "election started");

        loop {
            match self.coordinator.campaign(&self.candidate, self.lease).await {
                Ok(won) => {
                    failures = 0;
                    self.transition(if won { Role::Leader } else { Role::Follower });
                }
                Err(e) => {
                    failures += 1;
                    warn!(candidate = %self.candidate, failures, error = %e, "campaign failed");
                    self.transition(Role::Follower);
                    if failures >= self.max_consecutive_failures {
                        error!(candidate = %self.candidate, "giving up on election");
                        return Err(ClusterError::ElectionAbandoned(failures));
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.renew_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        if self.role() == Role::Leader {
            if let Err(e) = self.coordinator.resign(&self.candidate).await {
                warn!(candidate = %self.candidate, error = %e, "resign failed");
            }
            self.transition(Role::Follower);
        }
        debug!(candidate = %self.candidate, "election stopped");
        Ok(())
    }

    fn transition(&self, next: Role) {
        let changed = self.role.send_if_modified(|role| {
            if *role == next {
                return false;
            }
            *role = next;
            true
        });
        if !changed {
            return;
        }
        info!(candidate = %self.candidate, role = ?next, "role changed");
        for listener in &self.listeners {
            match next {
                Role::Leader => listener.on_elected(),
                Role::Follower => listener.on_demoted(),
            }
        }
    }
}
