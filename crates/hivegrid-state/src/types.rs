//! Domain types for the HiveGrid repository.
//!
//! These types represent the persisted state of virtual machines, local
//! controllers, group managers, and coordination leases. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use hive_core::{
    CapacityVector, GroupManagerId, ListenSettings, LocalControllerId, PowerStatus,
    VirtualMachineId, VirtualMachineStatus,
};

/// Timestamp (epoch millis) → sample.
pub type History<T> = BTreeMap<u64, T>;

// ── Virtual machine ───────────────────────────────────────────────

/// Where a VM currently lives. Both ids unset means the VM is free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VirtualMachineLocation {
    pub group_manager_id: Option<GroupManagerId>,
    pub local_controller_id: Option<LocalControllerId>,
    /// Control address of the hosting local controller.
    pub local_controller_address: Option<String>,
}

impl VirtualMachineLocation {
    pub fn on(group_manager_id: &str, local_controller_id: &str, address: &str) -> Self {
        Self {
            group_manager_id: Some(group_manager_id.to_string()),
            local_controller_id: Some(local_controller_id.to_string()),
            local_controller_address: Some(address.to_string()),
        }
    }

    /// Neither a group manager nor a local controller is set.
    pub fn is_free(&self) -> bool {
        self.group_manager_id.is_none() && self.local_controller_id.is_none()
    }
}

/// Metadata of a virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineMetaData {
    pub id: VirtualMachineId,
    pub status: VirtualMachineStatus,
    pub location: VirtualMachineLocation,
    /// Capacity asked for at submission.
    pub requested_capacity: CapacityVector,
    /// Used capacity samples, oldest first.
    #[serde(default)]
    pub monitoring: History<CapacityVector>,
    /// Set only when `status` is `Error`.
    pub error_code: Option<String>,
}

impl VirtualMachineMetaData {
    /// A freshly submitted, unbound VM.
    pub fn new(id: &str, requested_capacity: CapacityVector) -> Self {
        Self {
            id: id.to_string(),
            status: VirtualMachineStatus::Init,
            location: VirtualMachineLocation::default(),
            requested_capacity,
            monitoring: History::new(),
            error_code: None,
        }
    }

    /// The local controller currently hosting this VM, if any.
    pub fn local_controller_id(&self) -> Option<&str> {
        self.location.local_controller_id.as_deref()
    }

    /// Used capacity samples of the last `depth` entries, oldest first.
    pub fn recent_usage(&self, depth: usize) -> Vec<&CapacityVector> {
        tail(&self.monitoring, depth)
    }

    /// Copy with the monitoring history cut to the last `depth` entries.
    pub fn with_history_depth(mut self, depth: usize) -> Self {
        trim_history(&mut self.monitoring, depth);
        self
    }
}

// ── Local controller ──────────────────────────────────────────────

/// Description of a local controller (one per physical host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalControllerDescription {
    pub id: LocalControllerId,
    pub hostname: String,
    pub control_address: String,
    /// Group manager this controller reports to.
    pub group_manager_id: Option<GroupManagerId>,
    pub total_capacity: CapacityVector,
    #[serde(default)]
    pub power: PowerStatus,
    /// Host used-capacity samples, oldest first.
    #[serde(default)]
    pub monitoring: History<CapacityVector>,
    /// Ids of the VMs this controller hosts.
    #[serde(default)]
    pub virtual_machines: BTreeSet<VirtualMachineId>,
    /// Epoch millis of the last monitoring heartbeat.
    pub last_heartbeat: u64,
}

impl LocalControllerDescription {
    pub fn new(id: &str, control_address: &str, total_capacity: CapacityVector) -> Self {
        Self {
            id: id.to_string(),
            hostname: id.to_string(),
            control_address: control_address.to_string(),
            group_manager_id: None,
            total_capacity,
            power: PowerStatus::Active,
            monitoring: History::new(),
            virtual_machines: BTreeSet::new(),
            last_heartbeat: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.power == PowerStatus::Active
    }

    pub fn hosts(&self, vm_id: &str) -> bool {
        self.virtual_machines.contains(vm_id)
    }

    /// Used capacity samples of the last `depth` entries, oldest first.
    pub fn recent_usage(&self, depth: usize) -> Vec<&CapacityVector> {
        tail(&self.monitoring, depth)
    }

    pub fn with_history_depth(mut self, depth: usize) -> Self {
        trim_history(&mut self.monitoring, depth);
        self
    }
}

/// A single host monitoring sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMonitoringEntry {
    pub timestamp: u64,
    pub used_capacity: CapacityVector,
}

// ── Group manager ─────────────────────────────────────────────────

/// Aggregated capacity of a group manager's local controllers at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GroupManagerSummary {
    /// Capacity of active local controllers (after packing density).
    pub active_capacity: CapacityVector,
    /// Capacity of passive (powered-down) local controllers.
    pub passive_capacity: CapacityVector,
    /// Capacity used by hosted VMs.
    pub used_capacity: CapacityVector,
    pub local_controllers: u32,
    pub virtual_machines: u32,
}

/// Description of a group manager as seen by the group leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupManagerDescription {
    pub id: GroupManagerId,
    pub hostname: String,
    pub listen_settings: ListenSettings,
    pub heartbeat_address: String,
    /// Summaries, oldest first.
    #[serde(default)]
    pub summaries: History<GroupManagerSummary>,
    /// Epoch millis of the last heartbeat or summary.
    pub last_seen: u64,
}

impl GroupManagerDescription {
    pub fn new(id: &str, listen_settings: ListenSettings, heartbeat_address: &str) -> Self {
        Self {
            id: id.to_string(),
            hostname: id.to_string(),
            listen_settings,
            heartbeat_address: heartbeat_address.to_string(),
            summaries: History::new(),
            last_seen: 0,
        }
    }

    /// Summaries of the last `depth` entries, oldest first.
    pub fn recent_summaries(&self, depth: usize) -> Vec<&GroupManagerSummary> {
        tail(&self.summaries, depth)
    }

    pub fn with_history_depth(mut self, depth: usize) -> Self {
        trim_history(&mut self.summaries, depth);
        self
    }
}

// ── Coordination ──────────────────────────────────────────────────

/// A time-bounded claim on a named role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    /// Epoch millis after which the lease may be taken over.
    pub expires_at: u64,
}

impl Lease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

// ── Mutation outcomes ─────────────────────────────────────────────

/// Result of an atomic multi-record mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The records no longer match what the caller planned against.
    Stale { reason: String },
}

impl CommitOutcome {
    pub fn stale(reason: impl Into<String>) -> Self {
        CommitOutcome::Stale {
            reason: reason.into(),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

// ── History helpers ───────────────────────────────────────────────

/// Drop the oldest entries until at most `keep` remain.
pub fn trim_history<T>(history: &mut History<T>, keep: usize) {
    while history.len() > keep {
        history.pop_first();
    }
}

/// The last `depth` entries, oldest first.
pub fn tail<T>(history: &History<T>, depth: usize) -> Vec<&T> {
    let skip = history.len().saturating_sub(depth);
    history.values().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_keeps_newest() {
        let mut h: History<u32> = (0..10).map(|i| (i as u64, i)).collect();
        trim_history(&mut h, 3);
        assert_eq!(h.keys().copied().collect::<Vec<_>>(), vec![7, 8, 9]);
    }

    #[test]
    fn tail_is_oldest_first() {
        let h: History<u32> = (0..5).map(|i| (i as u64 * 10, i)).collect();
        assert_eq!(tail(&h, 2), vec![&3, &4]);
        assert_eq!(tail(&h, 50).len(), 5);
    }

    #[test]
    fn free_location() {
        assert!(VirtualMachineLocation::default().is_free());
        let loc = VirtualMachineLocation {
            group_manager_id: Some("gm-1".to_string()),
            ..Default::default()
        };
        assert!(!loc.is_free());
    }

    #[test]
    fn history_survives_json_roundtrip() {
        let mut vm = VirtualMachineMetaData::new("vm-1", CapacityVector::from_slice(&[1.0, 2.0]));
        vm.monitoring
            .insert(1000, CapacityVector::from_slice(&[0.5, 1.0]));
        let json = serde_json::to_vec(&vm).unwrap();
        let back: VirtualMachineMetaData = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, vm);
    }
}
