//! ResourceDemandEstimator: capacity vectors from monitoring history.
//!
//! Every policy asks the estimator, never the raw history, how much a VM
//! demands and how much room a local controller or group manager has left.
//! Active capacity is scaled by the packing density before used capacity is
//! subtracted; free capacity is clamped at zero.

use hive_core::config::{EstimatorConfig, HiveConfig, ThresholdsConfig};
use hive_core::CapacityVector;
use hivegrid_state::{
    GroupManagerDescription, GroupManagerSummary, LocalControllerDescription,
    VirtualMachineMetaData,
};
use tracing::trace;

use crate::aggregation::{aggregator_for, Aggregator};
use crate::error::{EstimatorError, EstimatorResult};

pub struct ResourceDemandEstimator {
    aggregator: Box<dyn Aggregator>,
    packing_density: f64,
    static_estimation: bool,
    number_of_monitoring_entries: usize,
    thresholds: ThresholdsConfig,
}

impl ResourceDemandEstimator {
    pub fn new(config: &EstimatorConfig, thresholds: ThresholdsConfig) -> EstimatorResult<Self> {
        if !(config.packing_density.is_finite() && config.packing_density > 0.0) {
            return Err(EstimatorError::InvalidPackingDensity(config.packing_density));
        }
        if config.number_of_monitoring_entries == 0 {
            return Err(EstimatorError::NoMonitoringEntries);
        }
        Ok(Self {
            aggregator: aggregator_for(config.aggregation),
            packing_density: config.packing_density,
            static_estimation: config.static_estimation,
            number_of_monitoring_entries: config.number_of_monitoring_entries,
            thresholds,
        })
    }

    pub fn from_config(config: &HiveConfig) -> EstimatorResult<Self> {
        Self::new(&config.estimator, config.thresholds.clone())
    }

    /// Replace the aggregation strategy.
    pub fn with_aggregator(mut self, aggregator: Box<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// History depth callers should request from the repository.
    pub fn number_of_monitoring_entries(&self) -> usize {
        self.number_of_monitoring_entries
    }

    pub fn packing_density(&self) -> f64 {
        self.packing_density
    }

    pub fn thresholds(&self) -> &ThresholdsConfig {
        &self.thresholds
    }

    /// Collapse samples (oldest first) per dimension. Missing samples → zeros.
    pub fn aggregate(&self, samples: &[&CapacityVector], dimensions: usize) -> CapacityVector {
        let dims = samples
            .iter()
            .map(|s| s.dimensions())
            .max()
            .unwrap_or(0)
            .max(dimensions);
        let values = (0..dims)
            .map(|i| {
                let column: Vec<f64> = samples.iter().map(|s| s.get(i)).collect();
                self.aggregator.aggregate(&column)
            })
            .collect();
        CapacityVector::new(values)
    }

    // ── Virtual machines ───────────────────────────────────────────

    pub fn estimate_virtual_machine_demand(&self, vm: &VirtualMachineMetaData) -> CapacityVector {
        if self.static_estimation {
            return vm.requested_capacity.clone();
        }
        let samples = vm.recent_usage(self.number_of_monitoring_entries);
        let demand = self.aggregate(&samples, vm.requested_capacity.dimensions());
        trace!(vm = %vm.id, samples = samples.len(), %demand, "vm demand estimated");
        demand
    }

    /// Sum of the demand of every VM.
    pub fn estimate_total_demand<'a>(
        &self,
        vms: impl IntoIterator<Item = &'a VirtualMachineMetaData>,
    ) -> CapacityVector {
        let mut total = CapacityVector::default();
        for vm in vms {
            total.accumulate(&self.estimate_virtual_machine_demand(vm));
        }
        total
    }

    // ── Local controllers ──────────────────────────────────────────

    /// Total capacity scaled by the packing density.
    pub fn compute_local_controller_total_capacity(
        &self,
        lc: &LocalControllerDescription,
    ) -> CapacityVector {
        lc.total_capacity.scale(self.packing_density)
    }

    pub fn compute_local_controller_used_capacity(
        &self,
        lc: &LocalControllerDescription,
    ) -> CapacityVector {
        let samples = lc.recent_usage(self.number_of_monitoring_entries);
        self.aggregate(&samples, lc.total_capacity.dimensions())
    }

    /// Free capacity: active minus used, clamped at zero.
    pub fn compute_local_controller_capacity(
        &self,
        lc: &LocalControllerDescription,
    ) -> CapacityVector {
        self.compute_local_controller_total_capacity(lc)
            .saturating_sub(&self.compute_local_controller_used_capacity(lc))
    }

    pub fn has_enough_local_controller_capacity(
        &self,
        vm: &VirtualMachineMetaData,
        lc: &LocalControllerDescription,
    ) -> bool {
        let demand = self.estimate_virtual_machine_demand(vm);
        let free = self.compute_local_controller_capacity(lc);
        demand.fits_within(&free)
    }

    /// Used over raw total capacity, per dimension.
    pub fn local_controller_utilization(&self, lc: &LocalControllerDescription) -> CapacityVector {
        self.compute_local_controller_used_capacity(lc)
            .ratio_to(&lc.total_capacity)
    }

    /// Any dimension above its max threshold.
    pub fn is_local_controller_overloaded(&self, lc: &LocalControllerDescription) -> bool {
        self.is_overloaded(
            &self.compute_local_controller_used_capacity(lc),
            &lc.total_capacity,
        )
    }

    /// Every dimension below its min threshold.
    pub fn is_local_controller_underloaded(&self, lc: &LocalControllerDescription) -> bool {
        self.is_underloaded(
            &self.compute_local_controller_used_capacity(lc),
            &lc.total_capacity,
        )
    }

    pub fn is_overloaded(&self, used: &CapacityVector, total: &CapacityVector) -> bool {
        used.exceeds_ratio(total, |i| self.thresholds.max(i))
    }

    pub fn is_underloaded(&self, used: &CapacityVector, total: &CapacityVector) -> bool {
        used.ratio_to(total)
            .values()
            .iter()
            .enumerate()
            .all(|(i, r)| *r < self.thresholds.min(i))
    }

    // ── Group managers ─────────────────────────────────────────────

    fn summary_vector(
        &self,
        gm: &GroupManagerDescription,
        field: impl Fn(&GroupManagerSummary) -> &CapacityVector,
    ) -> Option<CapacityVector> {
        let summaries = gm.recent_summaries(self.number_of_monitoring_entries);
        if summaries.is_empty() {
            return None;
        }
        let samples: Vec<&CapacityVector> = summaries.iter().map(|s| field(s)).collect();
        Some(self.aggregate(&samples, 0))
    }

    /// Active capacity from summaries. None without summary history.
    pub fn compute_group_manager_active_capacity(
        &self,
        gm: &GroupManagerDescription,
    ) -> Option<CapacityVector> {
        self.summary_vector(gm, |s| &s.active_capacity)
    }

    pub fn compute_group_manager_used_capacity(
        &self,
        gm: &GroupManagerDescription,
    ) -> Option<CapacityVector> {
        self.summary_vector(gm, |s| &s.used_capacity)
    }

    pub fn compute_group_manager_passive_capacity(
        &self,
        gm: &GroupManagerDescription,
    ) -> Option<CapacityVector> {
        self.summary_vector(gm, |s| &s.passive_capacity)
    }

    /// Free capacity of a group manager. None without summary history.
    pub fn compute_group_manager_capacity(
        &self,
        gm: &GroupManagerDescription,
    ) -> Option<CapacityVector> {
        let active = self.compute_group_manager_active_capacity(gm)?;
        let used = self.compute_group_manager_used_capacity(gm)?;
        Some(active.saturating_sub(&used))
    }

    /// Whether the combined demand of `vms` fits the group manager's free capacity.
    pub fn has_enough_group_manager_capacity(
        &self,
        vms: &[VirtualMachineMetaData],
        gm: &GroupManagerDescription,
    ) -> bool {
        let Some(free) = self.compute_group_manager_capacity(gm) else {
            return false;
        };
        let mut demand = CapacityVector::zeros(free.dimensions());
        for vm in vms {
            demand.accumulate(&self.estimate_virtual_machine_demand(vm));
        }
        demand.fits_within(&free)
    }
}
