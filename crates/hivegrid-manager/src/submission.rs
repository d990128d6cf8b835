//! VM submissions, from the group leader down to a local controller.
//!
//! The group leader registers submitted VMs and dispatches the free ones to
//! group managers. Each group manager then places its `Init` VMs onto its
//! own local controllers and starts them.

use std::sync::Arc;

use tracing::{debug, info, warn};

use hive_core::VirtualMachineStatus;
use hivegrid_migration::{EnforcementReport, PlanEnforcer};
use hivegrid_placement::{
    DispatchingPlan, DispatchingPolicy, PlacementPlan, PlacementPolicy, split_submission,
};
use hivegrid_state::{CommitOutcome, Repository, VirtualMachineMetaData};

use crate::error::ManagerResult;

pub struct SubmissionService {
    repository: Arc<dyn Repository>,
    dispatching: DispatchingPolicy,
    placement: PlacementPolicy,
    enforcer: Arc<PlanEnforcer>,
    history_depth: usize,
}

impl SubmissionService {
    pub fn new(
        dispatching: DispatchingPolicy,
        placement: PlacementPolicy,
        enforcer: Arc<PlanEnforcer>,
        history_depth: usize,
    ) -> Self {
        Self {
            repository: Arc::clone(enforcer.repository()),
            dispatching,
            placement,
            enforcer,
            history_depth,
        }
    }

    /// Group leader side. Bound VMs are stored as submitted, joining the
    /// host set of a pinned local controller; free VMs are stored with the
    /// group manager chosen for them, or unbound when none had room. `Error`
    /// VMs are rejected.
    pub fn dispatch(&self, virtual_machines: Vec<VirtualMachineMetaData>) -> ManagerResult<DispatchingPlan> {
        let submitted = virtual_machines.len();
        let split = split_submission(virtual_machines);
        let bound = split.bound.len();
        let rejected = submitted - bound - split.free.len();
        if rejected > 0 {
            warn!(rejected, "error vms rejected from submission");
        }

        for mut vm in split.bound {
            if let CommitOutcome::Stale { reason } = self.repository.register_virtual_machine(&vm)? {
                warn!(vm = %vm.id, %reason, "pinned local controller unknown, pin dropped");
                vm.location.local_controller_id = None;
                vm.location.local_controller_address = None;
                self.repository.put_virtual_machine(&vm)?;
            }
        }

        let group_managers = self
            .repository
            .get_group_manager_descriptions(self.history_depth)?;
        let plan = self.dispatching.dispatch(&split.free, group_managers);
        for mut vm in split.free {
            vm.location.group_manager_id = plan.assignments.get(&vm.id).cloned();
            self.repository.put_virtual_machine(&vm)?;
        }

        info!(
            bound,
            dispatched = plan.assignments.len(),
            unassigned = plan.unassigned.len(),
            "submission dispatched"
        );
        Ok(plan)
    }

    /// Dispatch every stored VM that is still `Init` and unbound. VMs left
    /// unassigned stay free and are retried on the next call.
    pub fn dispatch_pending(&self) -> ManagerResult<Option<DispatchingPlan>> {
        let pending: Vec<_> = self
            .repository
            .get_virtual_machines(self.history_depth)?
            .into_iter()
            .filter(|vm| vm.status == VirtualMachineStatus::Init && vm.location.is_free())
            .collect();
        if pending.is_empty() {
            return Ok(None);
        }
        self.dispatch(pending).map(Some)
    }

    /// Group manager side: place and start every `Init` VM dispatched to
    /// `group_manager_id`. VMs pinned to a local controller go there as is.
    pub async fn place(&self, group_manager_id: &str) -> ManagerResult<(PlacementPlan, EnforcementReport)> {
        let depth = self.history_depth;
        let local_controllers: Vec<_> = self
            .repository
            .get_local_controller_descriptions(depth)?
            .into_iter()
            .filter(|lc| lc.group_manager_id.as_deref() == Some(group_manager_id))
            .collect();

        let (pinned, pending): (Vec<_>, Vec<_>) = self
            .repository
            .get_virtual_machines(depth)?
            .into_iter()
            .filter(|vm| {
                vm.status == VirtualMachineStatus::Init
                    && vm.location.group_manager_id.as_deref() == Some(group_manager_id)
            })
            .partition(|vm| vm.location.local_controller_id.is_some());

        let mut plan = self.placement.place(pending, local_controllers);
        for vm in pinned {
            if let Some(lc) = vm.location.local_controller_id {
                debug!(vm = %vm.id, local_controller = %lc, "pinned vm");
                plan.assignments.insert(vm.id, lc);
            }
        }

        let report = self.enforcer.enforce_placement(&plan).await;
        Ok((plan, report))
    }
}
