//! Reconfiguration: consolidate running VMs onto fewer local controllers.
//!
//! The search is greedy. Controllers are ranked by decreasing load; starting
//! from the least loaded, every hosted VM (largest first) is tried first-fit
//! on the more loaded controllers. A controller is only evacuated if all of
//! its VMs find room; otherwise its tentative moves are rolled back. A pass
//! never emits more than `max_migrations` moves.
//!
//! Before searching, a lower bound on the number of controllers the current
//! demand needs is compared with the number in use. If they match there is
//! nothing to gain and the plan is empty.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use hive_core::config::ReconfigurationConfig;
use hive_core::{CapacityVector, VirtualMachineStatus};
use hivegrid_estimator::sort::sort_local_controllers_by_usage;
use hivegrid_estimator::{ResourceDemandEstimator, SortOrder};
use hivegrid_state::{LocalControllerDescription, VirtualMachineMetaData};

use crate::ledger::CapacityLedger;
use crate::plan::{MigrationPlan, ReconfigurationPlan};

pub struct ReconfigurationPolicy {
    estimator: Arc<ResourceDemandEstimator>,
    max_migrations: usize,
}

impl ReconfigurationPolicy {
    pub fn new(estimator: Arc<ResourceDemandEstimator>, config: &ReconfigurationConfig) -> Self {
        Self {
            estimator,
            max_migrations: config.max_migrations,
        }
    }

    pub fn with_max_migrations(mut self, max_migrations: usize) -> Self {
        self.max_migrations = max_migrations;
        self
    }

    pub fn reconfigure(
        &self,
        local_controllers: Vec<LocalControllerDescription>,
        virtual_machines: Vec<VirtualMachineMetaData>,
    ) -> ReconfigurationPlan {
        let active: Vec<LocalControllerDescription> = local_controllers
            .into_iter()
            .filter(LocalControllerDescription::is_active)
            .collect();
        if active.len() < 2 {
            return ReconfigurationPlan::empty();
        }

        let vms: BTreeMap<&str, &VirtualMachineMetaData> = virtual_machines
            .iter()
            .map(|vm| (vm.id.as_str(), vm))
            .collect();

        let in_use = active.iter().filter(|lc| !lc.virtual_machines.is_empty()).count();
        let bound = self.lower_bound(&active, vms.values().copied());
        if in_use <= bound {
            debug!(in_use, bound, "configuration already minimal");
            return ReconfigurationPlan::empty();
        }

        let ranked = sort_local_controllers_by_usage(&self.estimator, active, SortOrder::Decreasing);
        let mut ledger = CapacityLedger::new(&self.estimator, &ranked);
        let mut migration = MigrationPlan::default();
        let mut released: HashSet<String> = HashSet::new();
        let mut receivers: HashSet<String> = HashSet::new();

        for (position, source) in ranked.iter().enumerate().rev() {
            if source.virtual_machines.is_empty() || receivers.contains(&source.id) {
                continue;
            }
            let Some(movable) = self.movable_virtual_machines(source, &vms) else {
                debug!(local_controller = %source.id, "hosts a vm that cannot migrate, skipped");
                continue;
            };
            if migration.number_of_migrations() + movable.len() > self.max_migrations {
                debug!(local_controller = %source.id, "migration budget exhausted");
                break;
            }

            let targets: Vec<&LocalControllerDescription> = ranked[..position]
                .iter()
                .filter(|lc| !released.contains(&lc.id))
                .collect();

            let mut moves: Vec<(&str, &str, CapacityVector)> = Vec::new();
            for (vm, demand) in &movable {
                let Some(target) = targets.iter().find(|t| ledger.fits(&t.id, demand)) else {
                    break;
                };
                ledger.reserve(&target.id, demand);
                moves.push((vm.id.as_str(), target.id.as_str(), demand.clone()));
            }

            if moves.len() == movable.len() {
                for (vm_id, target, demand) in &moves {
                    ledger.release(&source.id, demand);
                    migration.add(vm_id, &source.id, target);
                    receivers.insert(target.to_string());
                }
                released.insert(source.id.clone());
                debug!(local_controller = %source.id, moves = moves.len(), "controller evacuated");
            } else {
                for (_, target, demand) in &moves {
                    ledger.release(target, demand);
                }
            }
        }

        migration.released_nodes = released.len();
        migration.used_nodes = ledger.used_nodes();
        let plan = ReconfigurationPlan::from_migration_plans([migration]);
        if !plan.is_empty() {
            info!(
                migrations = plan.number_of_migrations(),
                released = plan.released_nodes,
                used = plan.used_nodes,
                "consolidation plan computed"
            );
        }
        plan
    }

    /// Minimum number of controllers able to hold the total demand,
    /// assuming every controller were as large as the largest one.
    fn lower_bound<'a>(
        &self,
        local_controllers: &[LocalControllerDescription],
        virtual_machines: impl Iterator<Item = &'a VirtualMachineMetaData>,
    ) -> usize {
        let demand = self.estimator.estimate_total_demand(virtual_machines);
        let mut largest = CapacityVector::default();
        for lc in local_controllers {
            let active = self.estimator.compute_local_controller_total_capacity(lc);
            let dims = largest.dimensions().max(active.dimensions());
            largest = CapacityVector::new(
                (0..dims).map(|i| largest.get(i).max(active.get(i))).collect(),
            );
        }
        (0..demand.dimensions())
            .map(|i| {
                let (need, size) = (demand.get(i), largest.get(i));
                if need <= 0.0 {
                    0
                } else if size <= 0.0 {
                    usize::MAX
                } else {
                    (need / size).ceil() as usize
                }
            })
            .max()
            .unwrap_or(0)
    }

    /// Running VMs of `source` with their demand, largest first. None if any
    /// hosted VM is unknown or not running.
    fn movable_virtual_machines<'a>(
        &self,
        source: &LocalControllerDescription,
        vms: &BTreeMap<&str, &'a VirtualMachineMetaData>,
    ) -> Option<Vec<(&'a VirtualMachineMetaData, CapacityVector)>> {
        let mut movable = Vec::with_capacity(source.virtual_machines.len());
        for vm_id in &source.virtual_machines {
            let vm = *vms.get(vm_id.as_str())?;
            if vm.status != VirtualMachineStatus::Running {
                return None;
            }
            movable.push((vm, self.estimator.estimate_virtual_machine_demand(vm)));
        }
        movable.sort_by(|(_, a), (_, b)| b.l1_norm().total_cmp(&a.l1_norm()));
        Some(movable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::config::{EstimatorConfig, ThresholdsConfig};
    use hivegrid_state::VirtualMachineLocation;

    fn estimator() -> Arc<ResourceDemandEstimator> {
        let config = EstimatorConfig {
            static_estimation: true,
            ..Default::default()
        };
        Arc::new(ResourceDemandEstimator::new(&config, ThresholdsConfig::default()).unwrap())
    }

    fn policy() -> ReconfigurationPolicy {
        ReconfigurationPolicy::new(estimator(), &ReconfigurationConfig::default())
    }

    /// Build a cluster from `(lc_id, [vm demand..])`, with host usage
    /// equal to the sum of hosted demand.
    fn cluster(
        layout: &[(&str, &[f64])],
    ) -> (Vec<LocalControllerDescription>, Vec<VirtualMachineMetaData>) {
        let mut lcs = Vec::new();
        let mut vms = Vec::new();
        for (lc_id, demands) in layout {
            let mut lc =
                LocalControllerDescription::new(lc_id, lc_id, CapacityVector::from_slice(&[10.0, 10.0]));
            let mut used = 0.0;
            for (i, d) in demands.iter().enumerate() {
                let id = format!("{lc_id}-vm{i}");
                let mut vm = VirtualMachineMetaData::new(&id, CapacityVector::from_slice(&[*d, *d]));
                vm.status = VirtualMachineStatus::Running;
                vm.location = VirtualMachineLocation::on("gm-1", lc_id, lc_id);
                lc.virtual_machines.insert(id);
                used += d;
                vms.push(vm);
            }
            lc.monitoring.insert(1, CapacityVector::from_slice(&[used, used]));
            lcs.push(lc);
        }
        (lcs, vms)
    }

    fn apply(
        plan: &ReconfigurationPlan,
        lcs: &mut [LocalControllerDescription],
        vms: &mut [VirtualMachineMetaData],
    ) {
        for d in &plan.directives {
            let vm = vms.iter_mut().find(|v| v.id == d.virtual_machine_id).unwrap();
            let demand = vm.requested_capacity.clone();
            vm.location.local_controller_id = Some(d.destination.clone());
            for lc in lcs.iter_mut() {
                let used = lc.monitoring[&1].clone();
                if lc.id == d.source {
                    lc.virtual_machines.remove(&d.virtual_machine_id);
                    lc.monitoring.insert(1, used.saturating_sub(&demand));
                } else if lc.id == d.destination {
                    lc.virtual_machines.insert(d.virtual_machine_id.clone());
                    lc.monitoring.insert(1, used.add(&demand));
                }
            }
        }
    }

    #[test]
    fn consolidates_lightly_loaded_controllers() {
        let (lcs, vms) = cluster(&[("lc-1", &[5.0]), ("lc-2", &[2.0]), ("lc-3", &[1.0])]);
        let plan = policy().reconfigure(lcs, vms);

        assert_eq!(plan.released_nodes, 2);
        assert_eq!(plan.number_of_migrations(), 2);
        assert!(plan.directives.iter().all(|d| d.destination == "lc-1"));
        assert_eq!(plan.used_nodes, 1);
    }

    #[test]
    fn never_exceeds_capacity() {
        let (lcs, vms) = cluster(&[("lc-1", &[6.0]), ("lc-2", &[6.0]), ("lc-3", &[3.0])]);
        let plan = policy().reconfigure(lcs, vms);

        // lc-3's VM fits on either, but the 6s cannot share a host.
        assert_eq!(plan.number_of_migrations(), 1);
        assert_eq!(plan.directives[0].source, "lc-3");
        assert_eq!(plan.released_nodes, 1);
    }

    #[test]
    fn minimal_configuration_is_idempotent() {
        let (mut lcs, mut vms) = cluster(&[("lc-1", &[5.0]), ("lc-2", &[2.0]), ("lc-3", &[1.0])]);
        let plan = policy().reconfigure(lcs.clone(), vms.clone());
        apply(&plan, &mut lcs, &mut vms);

        let again = policy().reconfigure(lcs.clone(), vms.clone());
        assert!(again.is_empty());
        let third = policy().reconfigure(lcs, vms);
        assert!(third.is_empty());
    }

    #[test]
    fn lower_bound_short_circuits() {
        let (lcs, vms) = cluster(&[("lc-1", &[8.0]), ("lc-2", &[8.0])]);
        assert!(policy().reconfigure(lcs, vms).is_empty());
    }

    #[test]
    fn respects_migration_budget() {
        let (lcs, vms) =
            cluster(&[("lc-1", &[4.0]), ("lc-2", &[1.0, 1.0]), ("lc-3", &[1.0])]);
        let plan = policy().with_max_migrations(1).reconfigure(lcs, vms);
        assert!(plan.number_of_migrations() <= 1);
    }

    #[test]
    fn hosts_with_non_running_vms_stay() {
        let (lcs, mut vms) = cluster(&[("lc-1", &[5.0]), ("lc-2", &[1.0])]);
        vms[1].status = VirtualMachineStatus::Suspended;
        assert!(policy().reconfigure(lcs, vms).is_empty());
    }
}
