//! Capacity-norm ordering of VMs, local controllers, and group managers.
//!
//! Entities are ordered by the L1 norm of a primary vector with a tie-break
//! on a secondary vector. An entity without a primary vector (a group
//! manager that never sent a summary) is incomparable: it keeps its input
//! position relative to other incomparable entities and is placed after
//! every comparable one.

use std::cmp::Ordering;

use hive_core::CapacityVector;
use hivegrid_state::{GroupManagerDescription, LocalControllerDescription, VirtualMachineMetaData};

use crate::estimator::ResourceDemandEstimator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Increasing,
    #[default]
    Decreasing,
}

/// Norms an entity is ordered by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortKey {
    pub primary: f64,
    pub secondary: f64,
}

impl SortKey {
    pub fn new(primary: &CapacityVector, secondary: Option<&CapacityVector>) -> Self {
        Self {
            primary: primary.l1_norm(),
            secondary: secondary.map(CapacityVector::l1_norm).unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormComparator {
    order: SortOrder,
}

impl NormComparator {
    pub fn new(order: SortOrder) -> Self {
        Self { order }
    }

    pub fn compare(&self, a: &SortKey, b: &SortKey) -> Ordering {
        let ordering = a
            .primary
            .total_cmp(&b.primary)
            .then_with(|| a.secondary.total_cmp(&b.secondary));
        match self.order {
            SortOrder::Increasing => ordering,
            SortOrder::Decreasing => ordering.reverse(),
        }
    }

    /// Stable sort; entities keyed `None` go last in input order.
    pub fn sort<T>(&self, items: Vec<T>, key: impl Fn(&T) -> Option<SortKey>) -> Vec<T> {
        let mut comparable = Vec::with_capacity(items.len());
        let mut incomparable = Vec::new();
        for item in items {
            match key(&item) {
                Some(k) => comparable.push((k, item)),
                None => incomparable.push(item),
            }
        }
        comparable.sort_by(|(a, _), (b, _)| self.compare(a, b));
        comparable
            .into_iter()
            .map(|(_, item)| item)
            .chain(incomparable)
            .collect()
    }
}

/// Order VMs by estimated demand.
pub fn sort_virtual_machines(
    estimator: &ResourceDemandEstimator,
    vms: Vec<VirtualMachineMetaData>,
    order: SortOrder,
) -> Vec<VirtualMachineMetaData> {
    NormComparator::new(order).sort(vms, |vm| {
        Some(SortKey::new(
            &estimator.estimate_virtual_machine_demand(vm),
            None,
        ))
    })
}

/// Order local controllers by free capacity, tie-break on used capacity.
pub fn sort_local_controllers(
    estimator: &ResourceDemandEstimator,
    lcs: Vec<LocalControllerDescription>,
    order: SortOrder,
) -> Vec<LocalControllerDescription> {
    NormComparator::new(order).sort(lcs, |lc| {
        Some(SortKey::new(
            &estimator.compute_local_controller_capacity(lc),
            Some(&estimator.compute_local_controller_used_capacity(lc)),
        ))
    })
}

/// Order local controllers by used capacity.
pub fn sort_local_controllers_by_usage(
    estimator: &ResourceDemandEstimator,
    lcs: Vec<LocalControllerDescription>,
    order: SortOrder,
) -> Vec<LocalControllerDescription> {
    NormComparator::new(order).sort(lcs, |lc| {
        Some(SortKey::new(
            &estimator.compute_local_controller_used_capacity(lc),
            None,
        ))
    })
}

/// Order group managers by free capacity, tie-break on passive capacity.
pub fn sort_group_managers(
    estimator: &ResourceDemandEstimator,
    gms: Vec<GroupManagerDescription>,
    order: SortOrder,
) -> Vec<GroupManagerDescription> {
    NormComparator::new(order).sort(gms, |gm| {
        let free = estimator.compute_group_manager_capacity(gm)?;
        let passive = estimator.compute_group_manager_passive_capacity(gm);
        Some(SortKey::new(&free, passive.as_ref()))
    })
}
