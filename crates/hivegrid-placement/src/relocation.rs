//! Relocation: move VMs off a single anomalous local controller.
//!
//! Overload relief moves the largest VMs first until the source drops under
//! its max thresholds, each to the least used candidate that can take it
//! without becoming overloaded itself. Relief may be partial.
//!
//! Underload evacuation moves every VM off the source so it can be released.
//! It is all-or-nothing: if one VM finds no room the plan is empty.

use std::sync::Arc;

use tracing::{debug, info, warn};

use hive_core::config::RelocationConfig;
use hive_core::{CapacityVector, LocalControllerState, VirtualMachineStatus};
use hivegrid_estimator::sort::{sort_local_controllers_by_usage, sort_virtual_machines};
use hivegrid_estimator::{ResourceDemandEstimator, SortOrder};
use hivegrid_state::{LocalControllerDescription, VirtualMachineMetaData};

use crate::ledger::CapacityLedger;
use crate::plan::{MigrationPlan, ReconfigurationPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    Overload,
    Underload,
}

impl RelocationKind {
    /// The relocation that answers an anomaly, if any.
    pub fn for_state(state: LocalControllerState) -> Option<Self> {
        match state {
            LocalControllerState::Overloaded => Some(RelocationKind::Overload),
            LocalControllerState::Underloaded => Some(RelocationKind::Underload),
            LocalControllerState::Stable => None,
        }
    }
}

pub struct RelocationPolicy {
    estimator: Arc<ResourceDemandEstimator>,
    overload: bool,
    underload: bool,
}

impl RelocationPolicy {
    pub fn new(estimator: Arc<ResourceDemandEstimator>, config: &RelocationConfig) -> Self {
        Self {
            estimator,
            overload: config.overload,
            underload: config.underload,
        }
    }

    pub fn is_enabled(&self, kind: RelocationKind) -> bool {
        match kind {
            RelocationKind::Overload => self.overload,
            RelocationKind::Underload => self.underload,
        }
    }

    pub fn relocate_virtual_machines(
        &self,
        kind: RelocationKind,
        source: &LocalControllerDescription,
        destination_candidates: Vec<LocalControllerDescription>,
        virtual_machines: Vec<VirtualMachineMetaData>,
    ) -> ReconfigurationPlan {
        if !self.is_enabled(kind) {
            debug!(?kind, local_controller = %source.id, "relocation disabled");
            return ReconfigurationPlan::empty();
        }
        let movable: Vec<VirtualMachineMetaData> = virtual_machines
            .into_iter()
            .filter(|vm| {
                vm.status == VirtualMachineStatus::Running
                    && vm.local_controller_id() == Some(source.id.as_str())
            })
            .collect();
        let candidates: Vec<LocalControllerDescription> = destination_candidates
            .into_iter()
            .filter(|lc| lc.id != source.id && lc.is_active())
            .collect();

        match kind {
            RelocationKind::Overload => self.relieve_overload(source, candidates, movable),
            RelocationKind::Underload => self.evacuate_underload(source, candidates, movable),
        }
    }

    fn relieve_overload(
        &self,
        source: &LocalControllerDescription,
        candidates: Vec<LocalControllerDescription>,
        movable: Vec<VirtualMachineMetaData>,
    ) -> ReconfigurationPlan {
        let candidates = sort_local_controllers_by_usage(&self.estimator, candidates, SortOrder::Increasing);
        let vms = sort_virtual_machines(&self.estimator, movable, SortOrder::Decreasing);
        let mut ledger = CapacityLedger::new(&self.estimator, &candidates);
        let mut source_used = self.estimator.compute_local_controller_used_capacity(source);
        let mut migration = MigrationPlan::default();
        let mut unrelocated = Vec::new();

        for vm in &vms {
            if !self.estimator.is_overloaded(&source_used, &source.total_capacity) {
                break;
            }
            let demand = self.estimator.estimate_virtual_machine_demand(vm);
            match self.find_destination(&ledger, &candidates, &demand) {
                Some(destination) => {
                    ledger.reserve(&destination, &demand);
                    source_used = source_used.saturating_sub(&demand);
                    migration.add(&vm.id, &source.id, &destination);
                }
                None => unrelocated.push(vm.id.clone()),
            }
        }

        migration.used_nodes = ledger.used_nodes();
        let mut plan = ReconfigurationPlan::from_migration_plans([migration]);
        plan.unrelocated = unrelocated;
        plan.residual_overload = self
            .estimator
            .is_overloaded(&source_used, &source.total_capacity);
        if plan.residual_overload {
            warn!(
                local_controller = %source.id,
                migrations = plan.number_of_migrations(),
                unrelocated = plan.unrelocated.len(),
                "overload only partially relieved"
            );
        } else {
            info!(local_controller = %source.id, migrations = plan.number_of_migrations(), "overload relocation computed");
        }
        plan
    }

    fn evacuate_underload(
        &self,
        source: &LocalControllerDescription,
        candidates: Vec<LocalControllerDescription>,
        movable: Vec<VirtualMachineMetaData>,
    ) -> ReconfigurationPlan {
        if movable.is_empty() || movable.len() != source.virtual_machines.len() {
            debug!(local_controller = %source.id, "nothing to evacuate or a vm is not running");
            return ReconfigurationPlan::empty();
        }
        // Idle candidates would not gain anything from receiving the VMs.
        let candidates: Vec<LocalControllerDescription> = candidates
            .into_iter()
            .filter(|lc| !lc.virtual_machines.is_empty())
            .collect();
        let candidates = sort_local_controllers_by_usage(&self.estimator, candidates, SortOrder::Decreasing);
        let vms = sort_virtual_machines(&self.estimator, movable, SortOrder::Decreasing);
        let mut ledger = CapacityLedger::new(&self.estimator, &candidates);
        let mut migration = MigrationPlan::default();

        for vm in &vms {
            let demand = self.estimator.estimate_virtual_machine_demand(vm);
            let Some(destination) = self.find_destination(&ledger, &candidates, &demand) else {
                debug!(local_controller = %source.id, vm = %vm.id, "evacuation impossible");
                return ReconfigurationPlan {
                    unrelocated: vms.iter().map(|v| v.id.clone()).collect(),
                    ..ReconfigurationPlan::empty()
                };
            };
            ledger.reserve(&destination, &demand);
            migration.add(&vm.id, &source.id, &destination);
        }

        migration.used_nodes = ledger.used_nodes();
        migration.released_nodes = 1;
        let plan = ReconfigurationPlan::from_migration_plans([migration]);
        info!(local_controller = %source.id, migrations = plan.number_of_migrations(), "underload evacuation computed");
        plan
    }

    /// First candidate with room that stays under its max thresholds.
    fn find_destination(
        &self,
        ledger: &CapacityLedger,
        candidates: &[LocalControllerDescription],
        demand: &CapacityVector,
    ) -> Option<String> {
        candidates
            .iter()
            .filter_map(|lc| ledger.get(&lc.id))
            .find(|entry| {
                demand.fits_within(&entry.free)
                    && !self
                        .estimator
                        .is_overloaded(&entry.used.add(demand), &entry.total)
            })
            .map(|entry| entry.id.clone())
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

    fn policy() -> RelocationPolicy {
        RelocationPolicy::new(
            estimator(),
            &RelocationConfig {
                overload: true,
                underload: true,
            },
        )
    }

    fn host(id: &str, vms: &[(&str, f64)]) -> (LocalControllerDescription, Vec<VirtualMachineMetaData>) {
        let mut lc = LocalControllerDescription::new(id, id, CapacityVector::from_slice(&[10.0, 10.0]));
        let mut out = Vec::new();
        let mut used = 0.0;
        for (vm_id, d) in vms {
            let mut vm = VirtualMachineMetaData::new(vm_id, CapacityVector::from_slice(&[*d, *d]));
            vm.status = VirtualMachineStatus::Running;
            vm.location = VirtualMachineLocation::on("gm-1", id, id);
            lc.virtual_machines.insert(vm_id.to_string());
            used += d;
            out.push(vm);
        }
        lc.monitoring.insert(1, CapacityVector::from_slice(&[used, used]));
        (lc, out)
    }

    #[test]
    fn overload_moves_largest_first_until_relieved() {
        let (source, vms) = host("src", &[("small", 1.0), ("big", 4.0), ("mid", 2.0), ("x", 2.5)]);
        let (quiet, _) = host("quiet", &[]);
        let (busy, _) = host("busy", &[("b", 5.0)]);

        let plan = policy().relocate_virtual_machines(
            RelocationKind::Overload,
            &source,
            vec![busy, quiet, source.clone()],
            vms,
        );

        // 9.5 used; moving "big" brings it to 5.5, under the 0.9 threshold.
        assert_eq!(plan.number_of_migrations(), 1);
        assert_eq!(plan.directives[0].virtual_machine_id, "big");
        assert_eq!(plan.directives[0].destination, "quiet");
        assert!(!plan.residual_overload);
        assert!(plan.directives.iter().all(|d| d.destination != "src"));
    }

    #[test]
    fn partial_relief_reports_residual_overload() {
        let (source, vms) = host("src", &[("a", 5.0), ("b", 4.8)]);
        let (nearly_full, _) = host("full", &[("f", 7.0)]);

        let plan = policy().relocate_virtual_machines(
            RelocationKind::Overload,
            &source,
            vec![nearly_full],
            vms,
        );
        assert!(plan.is_empty());
        assert!(plan.residual_overload);
        assert_eq!(plan.unrelocated, vec!["a", "b"]);
    }

    #[test]
    fn underload_is_all_or_nothing() {
        let (source, vms) = host("src", &[("a", 1.0), ("b", 1.5)]);
        let (roomy, _) = host("roomy", &[("r", 3.0)]);
        let (idle, _) = host("idle", &[]);

        let plan = policy().relocate_virtual_machines(
            RelocationKind::Underload,
            &source,
            vec![idle.clone(), roomy],
            vms.clone(),
        );
        assert_eq!(plan.number_of_migrations(), 2);
        assert!(plan.directives.iter().all(|d| d.destination == "roomy"));
        assert_eq!(plan.released_nodes, 1);

        let (tight, _) = host("tight", &[("t", 7.5)]);
        let plan = policy().relocate_virtual_machines(
            RelocationKind::Underload,
            &source,
            vec![idle, tight],
            vms,
        );
        assert!(plan.is_empty());
        assert_eq!(plan.unrelocated.len(), 2);
    }

    #[test]
    fn disabled_kind_yields_empty_plan() {
        let policy = RelocationPolicy::new(estimator(), &RelocationConfig::default());
        let (source, vms) = host("src", &[("a", 1.0)]);
        let (other, _) = host("other", &[("o", 1.0)]);
        let plan = policy.relocate_virtual_machines(RelocationKind::Underload, &source, vec![other], vms);
        assert!(plan.is_empty());
    }
}
