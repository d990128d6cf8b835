//! Membership tracker: who is alive one level down the hierarchy.
//!
//! A group leader tracks its group managers and a group manager tracks its
//! local controllers. Members join when first heard from (heartbeat,
//! summary, or monitoring sample) and fail once their last-seen time is
//! older than the dead timeout. Both transitions are persisted in the
//! repository and surfaced as events.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use hive_core::clock::epoch_millis;
use hive_core::{Event, EventKind, Notifier, VirtualMachineStatus};
use hivegrid_state::{GroupManagerDescription, LocalControllerDescription, Repository};

use crate::error::ClusterResult;
use crate::heartbeat::HeartbeatMessage;

/// Error code recorded on VMs whose host was declared dead.
pub const LOCAL_CONTROLLER_FAILED: &str = "LOCAL_CONTROLLER_FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    GroupManager,
    LocalController,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Alive,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: String,
    pub kind: MemberKind,
    /// Epoch millis.
    pub last_seen: u64,
    pub status: MemberStatus,
}

pub struct MembershipTracker {
    repository: Arc<dyn Repository>,
    notifier: Notifier,
    node_id: String,
    dead_timeout: Duration,
    watching_since: u64,
}

impl MembershipTracker {
    pub fn new(repository: Arc<dyn Repository>, notifier: Notifier, node_id: &str) -> Self {
        Self {
            repository,
            notifier,
            node_id: node_id.to_string(),
            dead_timeout: Duration::from_secs(30),
            watching_since: 0,
        }
    }

    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    /// Measure silence from no earlier than `since_ms`, so members recorded
    /// before this tracker started get a full dead timeout to be heard from.
    pub fn watching_since(mut self, since_ms: u64) -> Self {
        self.watching_since = since_ms;
        self
    }

    pub fn dead_timeout(&self) -> Duration {
        self.dead_timeout
    }

    /// Record a group manager heartbeat. Returns true when it just joined.
    pub fn observe_group_manager(&self, heartbeat: &HeartbeatMessage, now_ms: u64) -> ClusterResult<bool> {
        let known = self
            .repository
            .get_group_manager_descriptions(0)?
            .iter()
            .any(|gm| gm.id == heartbeat.identifier);

        let mut description = GroupManagerDescription::new(
            &heartbeat.identifier,
            heartbeat.listen_settings.clone(),
            &heartbeat.heartbeat_address,
        );
        description.last_seen = now_ms;
        self.repository.add_group_manager_description(&description)?;

        if !known {
            info!(group_manager = %heartbeat.identifier, "group manager joined");
            self.notifier
                .notify(Event::new(EventKind::GroupManagerJoined, &self.node_id, heartbeat));
        }
        Ok(!known)
    }

    /// Register a local controller. An already known controller keeps its
    /// hosted VMs and monitoring history; only its liveness is refreshed.
    pub fn join_local_controller(
        &self,
        mut description: LocalControllerDescription,
        now_ms: u64,
    ) -> ClusterResult<bool> {
        let existing = self.repository.get_local_controller(&description.id, usize::MAX)?;
        let joined = existing.is_none();
        let stored = match existing {
            Some(mut known) => {
                known.last_heartbeat = known.last_heartbeat.max(now_ms);
                known.control_address = description.control_address;
                known
            }
            None => {
                description.group_manager_id = Some(self.node_id.clone());
                description.last_heartbeat = now_ms;
                description
            }
        };
        self.repository.put_local_controller(&stored)?;

        if joined {
            info!(local_controller = %stored.id, address = %stored.control_address, "local controller joined");
            self.notifier.notify(Event::new(
                EventKind::LocalControllerJoined,
                &self.node_id,
                &stored.with_history_depth(0),
            ));
        }
        Ok(joined)
    }

    pub fn list_members(&self, now_ms: u64) -> ClusterResult<Vec<Member>> {
        let group_managers = self.repository.get_group_manager_descriptions(0)?;
        let local_controllers = self.repository.get_local_controller_descriptions(0)?;

        let members = group_managers
            .into_iter()
            .map(|gm| (gm.id, MemberKind::GroupManager, gm.last_seen))
            .chain(
                local_controllers
                    .into_iter()
                    .map(|lc| (lc.id, MemberKind::LocalController, lc.last_heartbeat)),
            )
            .map(|(id, kind, last_seen)| Member {
                status: self.status_of(last_seen, now_ms),
                id,
                kind,
                last_seen,
            })
            .collect();
        Ok(members)
    }

    /// Drop every dead member. Returns the ids that were removed.
    pub fn reap_dead_members(&self, now_ms: u64) -> ClusterResult<Vec<String>> {
        let mut reaped = Vec::new();
        for member in self.list_members(now_ms)? {
            if member.status != MemberStatus::Dead {
                continue;
            }
            match member.kind {
                MemberKind::GroupManager => {
                    self.repository.drop_group_manager(&member.id)?;
                    warn!(group_manager = %member.id, "group manager failed");
                    self.notifier
                        .notify(Event::new(EventKind::GroupManagerFailed, &self.node_id, &member));
                }
                MemberKind::LocalController => {
                    self.fail_local_controller(&member.id)?;
                    self.notifier.notify(Event::new(
                        EventKind::LocalControllerFailed,
                        &self.node_id,
                        &member,
                    ));
                }
            }
            reaped.push(member.id);
        }
        Ok(reaped)
    }

    /// Reap on a fixed interval until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reap_dead_members(epoch_millis()) {
                        Ok(reaped) if !reaped.is_empty() => {
                            info!(count = reaped.len(), "reaped dead members");
                        }
                        Err(e) => warn!(error = %e, "membership reaper error"),
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    debug!("membership reaper stopping");
                    break;
                }
            }
        }
    }

    fn status_of(&self, last_seen: u64, now_ms: u64) -> MemberStatus {
        let last_seen = last_seen.max(self.watching_since);
        if now_ms.saturating_sub(last_seen) > self.dead_timeout.as_millis() as u64 {
            MemberStatus::Dead
        } else {
            MemberStatus::Alive
        }
    }

    fn fail_local_controller(&self, id: &str) -> ClusterResult<()> {
        for vm in self.repository.get_virtual_machines_on(id, 0)? {
            if vm.status.is_terminal() {
                continue;
            }
            self.repository.update_virtual_machine_status(
                &vm.id,
                VirtualMachineStatus::Error,
                Some(LOCAL_CONTROLLER_FAILED.to_string()),
            )?;
        }
        self.repository.drop_local_controller(id)?;
        warn!(local_controller = %id, "local controller failed");
        Ok(())
    }
}
