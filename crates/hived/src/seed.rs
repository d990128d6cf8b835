//! Cluster seed files: local controllers and VM submissions loaded into the
//! store before a node starts.
//!
//! ```json
//! {
//!   "local_controllers": [
//!     { "id": "lc-1", "control_address": "10.0.0.11:5000", "total_capacity": [16, 64, 10] }
//!   ],
//!   "virtual_machines": [
//!     { "id": "vm-1", "requested_capacity": [2, 4, 1] }
//!   ]
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use hive_core::CapacityVector;
use hive_core::clock::epoch_millis;
use hivegrid_cluster::MembershipTracker;
use hivegrid_state::{LocalControllerDescription, Repository, VirtualMachineMetaData};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub local_controllers: Vec<SeedHost>,
    pub virtual_machines: Vec<SeedVirtualMachine>,
}

#[derive(Debug, Deserialize)]
pub struct SeedHost {
    pub id: String,
    pub control_address: String,
    pub total_capacity: CapacityVector,
    pub hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedVirtualMachine {
    pub id: String,
    pub requested_capacity: CapacityVector,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub joined: usize,
    pub refreshed: usize,
    pub submitted: usize,
    pub already_known: usize,
}

impl Seed {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        serde_json::from_str(content).context("parsing seed file")
    }

    /// Hosts join through `membership` so they belong to its node. VMs are
    /// stored as fresh, unbound submissions; ids already in the store are
    /// left alone.
    pub fn apply(
        self,
        repository: &dyn Repository,
        membership: &MembershipTracker,
    ) -> anyhow::Result<SeedReport> {
        let mut report = SeedReport::default();
        let now = epoch_millis();

        for host in self.local_controllers {
            let mut description =
                LocalControllerDescription::new(&host.id, &host.control_address, host.total_capacity);
            if let Some(hostname) = host.hostname {
                description.hostname = hostname;
            }
            if membership.join_local_controller(description, now)? {
                report.joined += 1;
            } else {
                report.refreshed += 1;
            }
        }

        for vm in self.virtual_machines {
            if repository.get_virtual_machine(&vm.id, 0)?.is_some() {
                report.already_known += 1;
                continue;
            }
            repository.put_virtual_machine(&VirtualMachineMetaData::new(&vm.id, vm.requested_capacity))?;
            report.submitted += 1;
        }

        info!(
            joined = report.joined,
            refreshed = report.refreshed,
            submitted = report.submitted,
            "seed applied"
        );
        Ok(report)
    }
}
