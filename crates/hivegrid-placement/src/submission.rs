//! Split a submission into VMs that already have a home and VMs that need
//! dispatching.

use hive_core::VirtualMachineStatus;
use hivegrid_state::VirtualMachineMetaData;

#[derive(Debug, Clone, Default)]
pub struct SubmissionSplit {
    /// VMs carrying a group manager and/or local controller id.
    pub bound: Vec<VirtualMachineMetaData>,
    /// VMs carrying neither.
    pub free: Vec<VirtualMachineMetaData>,
}

/// `Error` VMs are in neither list.
pub fn split_submission(virtual_machines: Vec<VirtualMachineMetaData>) -> SubmissionSplit {
    let mut split = SubmissionSplit::default();
    for vm in virtual_machines {
        if vm.status == VirtualMachineStatus::Error {
            continue;
        }
        if vm.location.is_free() {
            split.free.push(vm);
        } else {
            split.bound.push(vm);
        }
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::CapacityVector;
    use hivegrid_state::VirtualMachineLocation;

    #[test]
    fn classifies_bound_free_and_error() {
        let mut gm_bound = VirtualMachineMetaData::new("gm-bound", CapacityVector::zeros(2));
        gm_bound.location.group_manager_id = Some("gm-1".into());

        let mut fully_bound = VirtualMachineMetaData::new("fully-bound", CapacityVector::zeros(2));
        fully_bound.location = VirtualMachineLocation::on("gm-1", "lc-1", "lc-1:5000");

        let mut error = VirtualMachineMetaData::new("error", CapacityVector::zeros(2));
        error.status = VirtualMachineStatus::Error;
        error.location.group_manager_id = Some("gm-1".into());

        let free = VirtualMachineMetaData::new("free", CapacityVector::zeros(2));

        let split = split_submission(vec![gm_bound, fully_bound, error, free]);
        let bound: Vec<&str> = split.bound.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(bound, vec!["gm-bound", "fully-bound"]);
        assert_eq!(split.free.len(), 1);
        assert_eq!(split.free[0].id, "free");
    }

    #[test]
    fn local_controller_only_counts_as_bound() {
        let mut vm = VirtualMachineMetaData::new("lc-only", CapacityVector::zeros(2));
        vm.location.local_controller_id = Some("lc-1".into());
        let split = split_submission(vec![vm]);
        assert_eq!(split.bound.len(), 1);
        assert!(split.free.is_empty());
    }
}
