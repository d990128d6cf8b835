//! Plans: immutable decisions produced by policies and consumed by enforcers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hive_core::{GroupManagerId, LocalControllerId, VirtualMachineId};

/// New VMs assigned to local controllers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementPlan {
    pub assignments: BTreeMap<VirtualMachineId, LocalControllerId>,
    /// VMs that fit nowhere.
    pub unplaced: Vec<VirtualMachineId>,
    /// Controllers receiving or already hosting VMs.
    pub used_nodes: usize,
    /// Controllers left completely idle.
    pub released_nodes: usize,
}

impl PlacementPlan {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// VM moves between local controllers, as computed by one policy pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// VM → destination local controller.
    pub migrations: BTreeMap<VirtualMachineId, LocalControllerId>,
    /// VM → local controller it leaves.
    pub sources: BTreeMap<VirtualMachineId, LocalControllerId>,
    pub used_nodes: usize,
    pub released_nodes: usize,
}

impl MigrationPlan {
    pub fn add(&mut self, vm_id: &str, source: &str, destination: &str) {
        self.migrations
            .insert(vm_id.to_string(), destination.to_string());
        self.sources.insert(vm_id.to_string(), source.to_string());
    }

    pub fn number_of_migrations(&self) -> usize {
        self.migrations.len()
    }
}

/// Move one VM from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationDirective {
    pub virtual_machine_id: VirtualMachineId,
    pub source: LocalControllerId,
    pub destination: LocalControllerId,
}

/// Ordered relocation directives plus the bookkeeping of how they were found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconfigurationPlan {
    pub directives: Vec<RelocationDirective>,
    pub used_nodes: usize,
    pub released_nodes: usize,
    /// VMs the policy wanted to move but found no room for.
    pub unrelocated: Vec<VirtualMachineId>,
    /// The source is still above its max threshold after the plan.
    pub residual_overload: bool,
}

impl ReconfigurationPlan {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge migration plans; moves onto the current host are dropped.
    pub fn from_migration_plans(plans: impl IntoIterator<Item = MigrationPlan>) -> Self {
        let mut plan = Self::default();
        for migration_plan in plans {
            plan.used_nodes += migration_plan.used_nodes;
            plan.released_nodes += migration_plan.released_nodes;
            for (vm_id, destination) in migration_plan.migrations {
                let Some(source) = migration_plan.sources.get(&vm_id) else {
                    continue;
                };
                if *source == destination {
                    continue;
                }
                plan.directives.push(RelocationDirective {
                    source: source.clone(),
                    virtual_machine_id: vm_id,
                    destination,
                });
            }
        }
        plan
    }

    pub fn single(vm_id: &str, source: &str, destination: &str) -> Self {
        let mut migration = MigrationPlan::default();
        migration.add(vm_id, source, destination);
        Self::from_migration_plans([migration])
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn number_of_migrations(&self) -> usize {
        self.directives.len()
    }
}

/// Submitted VMs assigned to group managers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchingPlan {
    /// Group managers considered, in preference order.
    pub candidates: Vec<GroupManagerId>,
    pub assignments: BTreeMap<VirtualMachineId, GroupManagerId>,
    pub unassigned: Vec<VirtualMachineId>,
}

impl DispatchingPlan {
    /// Fold `other` into `self`. The first assignment of a VM wins.
    pub fn merge(&mut self, other: DispatchingPlan) {
        for candidate in other.candidates {
            if !self.candidates.contains(&candidate) {
                self.candidates.push(candidate);
            }
        }
        for (vm_id, gm_id) in other.assignments {
            self.assignments.entry(vm_id).or_insert(gm_id);
        }
        for vm_id in other.unassigned {
            if !self.unassigned.contains(&vm_id) {
                self.unassigned.push(vm_id);
            }
        }
        let assignments = &self.assignments;
        self.unassigned.retain(|vm_id| !assignments.contains_key(vm_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_directives_are_dropped() {
        let mut migration = MigrationPlan::default();
        migration.add("vm-1", "lc-1", "lc-2");
        migration.add("vm-2", "lc-1", "lc-1");
        migration.released_nodes = 1;

        let plan = ReconfigurationPlan::from_migration_plans([migration]);
        assert_eq!(plan.number_of_migrations(), 1);
        assert_eq!(plan.directives[0].virtual_machine_id, "vm-1");
        assert_eq!(plan.released_nodes, 1);
    }

    #[test]
    fn merge_keeps_first_assignment() {
        let mut a = DispatchingPlan {
            candidates: vec!["gm-1".into()],
            assignments: [("vm-1".to_string(), "gm-1".to_string())].into(),
            unassigned: vec!["vm-2".into()],
        };
        let b = DispatchingPlan {
            candidates: vec!["gm-2".into(), "gm-1".into()],
            assignments: [
                ("vm-1".to_string(), "gm-2".to_string()),
                ("vm-2".to_string(), "gm-2".to_string()),
            ]
            .into(),
            unassigned: vec!["vm-3".into()],
        };
        a.merge(b);

        assert_eq!(a.candidates, vec!["gm-1", "gm-2"]);
        assert_eq!(a.assignments["vm-1"], "gm-1");
        assert_eq!(a.assignments["vm-2"], "gm-2");
        assert_eq!(a.unassigned, vec!["vm-3"]);
    }
}
