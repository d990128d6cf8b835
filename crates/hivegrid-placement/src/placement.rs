//! Placement: assign new VMs to local controllers.
//!
//! `FirstFit` is first-fit decreasing: VMs by decreasing demand, each to the
//! first controller (optionally pre-sorted by decreasing free capacity) with
//! enough tentative free capacity. `RoundRobin` keeps the submission order
//! and starts the search for each VM at the controller after the one that
//! received the previous VM, across submissions.
//!
//! Passive controllers are never targets. A VM that fits nowhere is reported
//! unplaced; that is an outcome, not an error.

use std::sync::Arc;

use tracing::{debug, warn};

use hive_core::config::{PlacementConfig, PlacementStrategy};
use hivegrid_estimator::sort::{sort_local_controllers, sort_virtual_machines};
use hivegrid_estimator::{ResourceDemandEstimator, SortOrder};
use hivegrid_state::{LocalControllerDescription, VirtualMachineMetaData};

use crate::cursor::RotationCursor;
use crate::ledger::CapacityLedger;
use crate::plan::PlacementPlan;

pub struct PlacementPolicy {
    estimator: Arc<ResourceDemandEstimator>,
    strategy: PlacementStrategy,
    sort_local_controllers: bool,
    cursor: RotationCursor,
}

impl PlacementPolicy {
    pub fn new(estimator: Arc<ResourceDemandEstimator>, config: &PlacementConfig) -> Self {
        Self {
            estimator,
            strategy: config.strategy,
            sort_local_controllers: config.sort_local_controllers,
            cursor: RotationCursor::new(),
        }
    }

    pub fn strategy(&self) -> PlacementStrategy {
        self.strategy
    }

    pub fn place(
        &self,
        virtual_machines: Vec<VirtualMachineMetaData>,
        local_controllers: Vec<LocalControllerDescription>,
    ) -> PlacementPlan {
        let mut targets: Vec<LocalControllerDescription> = local_controllers
            .into_iter()
            .filter(LocalControllerDescription::is_active)
            .collect();
        if self.sort_local_controllers {
            targets = sort_local_controllers(&self.estimator, targets, SortOrder::Decreasing);
        }

        let virtual_machines = match self.strategy {
            PlacementStrategy::FirstFit => {
                sort_virtual_machines(&self.estimator, virtual_machines, SortOrder::Decreasing)
            }
            PlacementStrategy::RoundRobin => virtual_machines,
        };

        let mut ledger = CapacityLedger::new(&self.estimator, &targets);
        let mut plan = PlacementPlan::default();
        let target_ids: Vec<&str> = targets.iter().map(|lc| lc.id.as_str()).collect();
        let rotating = self.strategy == PlacementStrategy::RoundRobin;

        for vm in &virtual_machines {
            let demand = self.estimator.estimate_virtual_machine_demand(vm);
            let start = if rotating {
                self.cursor.resume(&target_ids).unwrap_or(0)
            } else {
                0
            };
            let chosen = (0..targets.len())
                .map(|offset| &targets[(start + offset) % targets.len()])
                .find(|lc| ledger.fits(&lc.id, &demand));

            match chosen {
                Some(lc) => {
                    if rotating {
                        self.cursor.record(&lc.id);
                    }
                    ledger.reserve(&lc.id, &demand);
                    plan.assignments.insert(vm.id.clone(), lc.id.clone());
                    debug!(vm = %vm.id, local_controller = %lc.id, %demand, "vm placed");
                }
                None => {
                    plan.unplaced.push(vm.id.clone());
                    debug!(vm = %vm.id, %demand, "no local controller has room");
                }
            }
        }

        if !plan.unplaced.is_empty() {
            warn!(
                unplaced = plan.unplaced.len(),
                "could not place all virtual machines, insufficient capacity"
            );
        }

        plan.used_nodes = ledger.used_nodes();
        plan.released_nodes = ledger.idle_nodes();
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::config::{EstimatorConfig, ThresholdsConfig};
    use hive_core::{CapacityVector, PowerStatus};

    fn estimator() -> Arc<ResourceDemandEstimator> {
        let config = EstimatorConfig {
            static_estimation: true,
            ..Default::default()
        };
        Arc::new(ResourceDemandEstimator::new(&config, ThresholdsConfig::default()).unwrap())
    }

    fn lc(id: &str, total: f64) -> LocalControllerDescription {
        LocalControllerDescription::new(id, id, CapacityVector::from_slice(&[total, total]))
    }

    fn vm(id: &str, demand: f64) -> VirtualMachineMetaData {
        VirtualMachineMetaData::new(id, CapacityVector::from_slice(&[demand, demand]))
    }

    fn policy(strategy: PlacementStrategy, sort: bool) -> PlacementPolicy {
        PlacementPolicy::new(
            estimator(),
            &PlacementConfig {
                strategy,
                sort_local_controllers: sort,
            },
        )
    }

    #[test]
    fn first_fit_decreasing_packs() {
        let plan = policy(PlacementStrategy::FirstFit, false).place(
            vec![vm("small", 2.0), vm("big", 6.0), vm("mid", 4.0)],
            vec![lc("lc-1", 8.0), lc("lc-2", 8.0)],
        );
        assert_eq!(plan.assignments["big"], "lc-1");
        assert_eq!(plan.assignments["mid"], "lc-2");
        assert_eq!(plan.assignments["small"], "lc-1");
        assert!(plan.unplaced.is_empty());
        assert_eq!(plan.used_nodes, 2);
        assert_eq!(plan.released_nodes, 0);
    }

    #[test]
    fn vm_that_fits_nowhere_is_unplaced() {
        let plan = policy(PlacementStrategy::FirstFit, true).place(
            vec![vm("huge", 20.0), vm("ok", 1.0)],
            vec![lc("lc-1", 8.0), lc("lc-2", 4.0)],
        );
        assert_eq!(plan.unplaced, vec!["huge"]);
        assert!(!plan.assignments.contains_key("huge"));
        assert_eq!(plan.assignments["ok"], "lc-1");
        assert_eq!(plan.released_nodes, 1);
    }

    #[test]
    fn passive_controllers_are_not_targets() {
        let mut passive = lc("lc-passive", 100.0);
        passive.power = PowerStatus::Passive;
        let plan = policy(PlacementStrategy::FirstFit, true)
            .place(vec![vm("vm-1", 1.0)], vec![passive, lc("lc-1", 4.0)]);
        assert_eq!(plan.assignments["vm-1"], "lc-1");
    }

    #[test]
    fn round_robin_rotates_start() {
        let policy = policy(PlacementStrategy::RoundRobin, false);
        let plan = policy.place(
            vec![vm("a", 1.0), vm("b", 1.0), vm("c", 1.0)],
            vec![lc("lc-1", 8.0), lc("lc-2", 8.0), lc("lc-3", 8.0)],
        );
        assert_eq!(plan.assignments["a"], "lc-1");
        assert_eq!(plan.assignments["b"], "lc-2");
        assert_eq!(plan.assignments["c"], "lc-3");
    }

    #[test]
    fn round_robin_skips_full_controllers() {
        let policy = policy(PlacementStrategy::RoundRobin, false);
        let plan = policy.place(
            vec![vm("a", 1.0), vm("b", 3.0)],
            vec![lc("lc-1", 8.0), lc("lc-2", 2.0)],
        );
        assert_eq!(plan.assignments["a"], "lc-1");
        assert_eq!(plan.assignments["b"], "lc-1");
    }

    #[test]
    fn placement_is_deterministic() {
        let make = || policy(PlacementStrategy::FirstFit, true);
        let input = || {
            (
                vec![vm("a", 3.0), vm("b", 3.0), vm("c", 2.0)],
                vec![lc("lc-1", 5.0), lc("lc-2", 5.0)],
            )
        };
        let (v1, l1) = input();
        let (v2, l2) = input();
        assert_eq!(make().place(v1, l1), make().place(v2, l2));
    }
}
