//! Dispatching: assign a submission of VMs to group managers.
//!
//! Runs on the group leader against group manager summaries. Group
//! managers without a summary have unknown capacity and are only ever
//! chosen by the capacity-blind strategies.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use hive_core::CapacityVector;
use hive_core::config::{DispatchingConfig, DispatchingStrategy};
use hivegrid_estimator::sort::sort_group_managers;
use hivegrid_estimator::{ResourceDemandEstimator, SortOrder};
use hivegrid_state::{GroupManagerDescription, VirtualMachineMetaData};

use crate::cursor::RotationCursor;
use crate::plan::DispatchingPlan;

pub struct DispatchingPolicy {
    estimator: Arc<ResourceDemandEstimator>,
    strategy: DispatchingStrategy,
    cursor: RotationCursor,
}

impl DispatchingPolicy {
    pub fn new(estimator: Arc<ResourceDemandEstimator>, config: &DispatchingConfig) -> Self {
        Self {
            estimator,
            strategy: config.strategy,
            cursor: RotationCursor::new(),
        }
    }

    pub fn strategy(&self) -> DispatchingStrategy {
        self.strategy
    }

    pub fn dispatch(
        &self,
        virtual_machines: &[VirtualMachineMetaData],
        group_managers: Vec<GroupManagerDescription>,
    ) -> DispatchingPlan {
        if group_managers.is_empty() {
            warn!(vms = virtual_machines.len(), "no group managers to dispatch to");
            return DispatchingPlan {
                unassigned: virtual_machines.iter().map(|vm| vm.id.clone()).collect(),
                ..Default::default()
            };
        }
        match self.strategy {
            DispatchingStrategy::FirstFit => self.first_fit(virtual_machines, group_managers),
            DispatchingStrategy::RoundRobin => {
                let ids: Vec<&str> = group_managers.iter().map(|gm| gm.id.as_str()).collect();
                let index = self.cursor.resume(&ids).unwrap_or(0);
                let chosen = &group_managers[index];
                self.cursor.record(&chosen.id);
                whole_submission(virtual_machines, chosen)
            }
            DispatchingStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..group_managers.len());
                whole_submission(virtual_machines, &group_managers[index])
            }
        }
    }

    fn first_fit(
        &self,
        virtual_machines: &[VirtualMachineMetaData],
        group_managers: Vec<GroupManagerDescription>,
    ) -> DispatchingPlan {
        let ranked = sort_group_managers(&self.estimator, group_managers, SortOrder::Decreasing);
        let mut free: Vec<(String, Option<CapacityVector>)> = ranked
            .iter()
            .map(|gm| (gm.id.clone(), self.estimator.compute_group_manager_capacity(gm)))
            .collect();

        let mut plan = DispatchingPlan {
            candidates: ranked.iter().map(|gm| gm.id.clone()).collect(),
            ..Default::default()
        };

        for vm in virtual_machines {
            let demand = self.estimator.estimate_virtual_machine_demand(vm);
            let slot = free.iter_mut().find(|(_, capacity)| {
                capacity
                    .as_ref()
                    .is_some_and(|c| demand.fits_within(c))
            });
            match slot {
                Some((gm_id, Some(capacity))) => {
                    *capacity = capacity.saturating_sub(&demand);
                    plan.assignments.insert(vm.id.clone(), gm_id.clone());
                    debug!(vm = %vm.id, group_manager = %gm_id, "vm dispatched");
                }
                _ => {
                    debug!(vm = %vm.id, %demand, "no group manager has room");
                    plan.unassigned.push(vm.id.clone());
                }
            }
        }
        plan
    }
}

fn whole_submission(
    virtual_machines: &[VirtualMachineMetaData],
    group_manager: &GroupManagerDescription,
) -> DispatchingPlan {
    debug!(group_manager = %group_manager.id, vms = virtual_machines.len(), "submission dispatched");
    DispatchingPlan {
        candidates: vec![group_manager.id.clone()],
        assignments: virtual_machines
            .iter()
            .map(|vm| (vm.id.clone(), group_manager.id.clone()))
            .collect(),
        unassigned: Vec::new(),
    }
}
