//! Tentative capacity bookkeeping used while a policy builds a plan.
//!
//! Policies reserve capacity on a local controller as they assign VMs to it,
//! so later decisions in the same pass see the reduced free capacity.
//! Nothing here touches the repository.

use std::collections::HashMap;

use hive_core::CapacityVector;
use hivegrid_estimator::ResourceDemandEstimator;
use hivegrid_state::LocalControllerDescription;

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: String,
    /// Raw total capacity, used for threshold ratios.
    pub total: CapacityVector,
    pub used: CapacityVector,
    pub free: CapacityVector,
    /// VMs hosted after the tentative moves.
    pub hosted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CapacityLedger {
    entries: Vec<LedgerEntry>,
    index: HashMap<String, usize>,
}

impl CapacityLedger {
    /// Snapshot `local_controllers` in the given order.
    pub fn new(
        estimator: &ResourceDemandEstimator,
        local_controllers: &[LocalControllerDescription],
    ) -> Self {
        let mut ledger = Self::default();
        for lc in local_controllers {
            ledger.index.insert(lc.id.clone(), ledger.entries.len());
            ledger.entries.push(LedgerEntry {
                id: lc.id.clone(),
                total: lc.total_capacity.clone(),
                used: estimator.compute_local_controller_used_capacity(lc),
                free: estimator.compute_local_controller_capacity(lc),
                hosted: lc.virtual_machines.len(),
            });
        }
        ledger
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&LedgerEntry> {
        self.index.get(id).map(|i| &self.entries[*i])
    }

    pub fn fits(&self, id: &str, demand: &CapacityVector) -> bool {
        self.get(id).is_some_and(|e| demand.fits_within(&e.free))
    }

    /// Take `demand` out of a controller's free capacity.
    pub fn reserve(&mut self, id: &str, demand: &CapacityVector) {
        if let Some(i) = self.index.get(id).copied() {
            let entry = &mut self.entries[i];
            entry.free = entry.free.saturating_sub(demand);
            entry.used = entry.used.add(demand);
            entry.hosted += 1;
        }
    }

    /// Give `demand` back to a controller.
    pub fn release(&mut self, id: &str, demand: &CapacityVector) {
        if let Some(i) = self.index.get(id).copied() {
            let entry = &mut self.entries[i];
            entry.free = entry.free.add(demand);
            entry.used = entry.used.saturating_sub(demand);
            entry.hosted = entry.hosted.saturating_sub(1);
        }
    }

    /// Controllers hosting at least one VM.
    pub fn used_nodes(&self) -> usize {
        self.entries.iter().filter(|e| e.hosted > 0).count()
    }

    /// Controllers hosting nothing.
    pub fn idle_nodes(&self) -> usize {
        self.entries.iter().filter(|e| e.hosted == 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::config::{EstimatorConfig, ThresholdsConfig};

    #[test]
    fn reserve_and_release_balance() {
        let est = ResourceDemandEstimator::new(&EstimatorConfig::default(), ThresholdsConfig::default())
            .unwrap();
        let lc = LocalControllerDescription::new("lc-1", "a", CapacityVector::from_slice(&[4.0, 4.0]));
        let mut ledger = CapacityLedger::new(&est, &[lc]);
        let demand = CapacityVector::from_slice(&[3.0, 1.0]);

        assert!(ledger.fits("lc-1", &demand));
        ledger.reserve("lc-1", &demand);
        assert!(!ledger.fits("lc-1", &demand));
        assert_eq!(ledger.used_nodes(), 1);

        ledger.release("lc-1", &demand);
        assert!(ledger.fits("lc-1", &demand));
        assert_eq!(ledger.idle_nodes(), 1);
        assert!(!ledger.fits("lc-404", &demand));
    }
}
