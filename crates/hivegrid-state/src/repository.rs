//! The repository capability consumed by the control plane.
//!
//! Policies read snapshots through this trait; enforcers and the monitoring
//! ingestion path write through it. Reads are snapshots: nothing guarantees
//! the cluster is unchanged by the time a plan based on them is enforced.

use hive_core::{CapacityVector, VirtualMachineStatus};

use crate::error::StateResult;
use crate::types::*;

pub trait Repository: Send + Sync {
    // ── Local controllers ──────────────────────────────────────────

    /// All local controllers, with monitoring cut to `history_depth` entries.
    fn get_local_controller_descriptions(
        &self,
        history_depth: usize,
    ) -> StateResult<Vec<LocalControllerDescription>>;

    fn get_local_controller(
        &self,
        id: &str,
        history_depth: usize,
    ) -> StateResult<Option<LocalControllerDescription>>;

    /// Insert or replace a local controller description.
    fn put_local_controller(&self, description: &LocalControllerDescription) -> StateResult<()>;

    /// Remove a local controller. Returns false if it was unknown.
    fn drop_local_controller(&self, id: &str) -> StateResult<bool>;

    /// Record a host monitoring sample. Returns false for unknown controllers.
    fn add_local_controller_monitoring(
        &self,
        id: &str,
        timestamp: u64,
        used_capacity: CapacityVector,
    ) -> StateResult<bool>;

    /// Mark a local controller as heard from at `timestamp` without
    /// recording a sample. Returns false for unknown controllers.
    fn refresh_local_controller(&self, id: &str, timestamp: u64) -> StateResult<bool>;

    /// The last `history_depth` host samples of a local controller, oldest first.
    fn get_host_monitoring_values(
        &self,
        local_controller_id: &str,
        history_depth: usize,
    ) -> StateResult<Vec<HostMonitoringEntry>>;

    // ── Group managers ─────────────────────────────────────────────

    fn get_group_manager_descriptions(
        &self,
        history_depth: usize,
    ) -> StateResult<Vec<GroupManagerDescription>>;

    /// Insert a group manager, keeping existing summaries if it was known.
    fn add_group_manager_description(&self, description: &GroupManagerDescription)
    -> StateResult<()>;

    fn add_group_manager_summary(
        &self,
        id: &str,
        timestamp: u64,
        summary: GroupManagerSummary,
    ) -> StateResult<bool>;

    fn drop_group_manager(&self, id: &str) -> StateResult<bool>;

    // ── Virtual machines ───────────────────────────────────────────

    fn get_virtual_machines(&self, history_depth: usize)
    -> StateResult<Vec<VirtualMachineMetaData>>;

    fn get_virtual_machine(
        &self,
        id: &str,
        history_depth: usize,
    ) -> StateResult<Option<VirtualMachineMetaData>>;

    /// VMs hosted by a local controller.
    fn get_virtual_machines_on(
        &self,
        local_controller_id: &str,
        history_depth: usize,
    ) -> StateResult<Vec<VirtualMachineMetaData>>;

    /// Insert or replace VM metadata. Does not touch host sets.
    fn put_virtual_machine(&self, vm: &VirtualMachineMetaData) -> StateResult<()>;

    /// Store a VM and, when it names a local controller, add it to that
    /// controller's host set in the same transaction. Status is kept as is.
    /// Returns `Stale` (and stores nothing) when the controller is unknown.
    fn register_virtual_machine(&self, vm: &VirtualMachineMetaData) -> StateResult<CommitOutcome>;

    fn add_virtual_machine_monitoring(
        &self,
        id: &str,
        timestamp: u64,
        used_capacity: CapacityVector,
    ) -> StateResult<bool>;

    /// Atomically bind a VM to a local controller and mark it running.
    fn assign_virtual_machine(
        &self,
        vm_id: &str,
        local_controller_id: &str,
    ) -> StateResult<CommitOutcome>;

    /// Atomically move a VM from `source` to `destination`.
    ///
    /// Updates the VM location and both hosted sets in one transaction.
    /// Returns `Stale` when the VM is gone, terminal, or no longer on `source`.
    fn commit_migration(
        &self,
        vm_id: &str,
        source: &str,
        destination: &str,
    ) -> StateResult<CommitOutcome>;

    /// Set a VM's status. Terminal statuses also detach it from its host.
    fn update_virtual_machine_status(
        &self,
        vm_id: &str,
        status: VirtualMachineStatus,
        error_code: Option<String>,
    ) -> StateResult<bool>;

    /// Delete a VM and detach it from its host.
    fn remove_virtual_machine(&self, vm_id: &str) -> StateResult<bool>;
}
