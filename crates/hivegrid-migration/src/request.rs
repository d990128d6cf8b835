//! A single VM migration handed to a worker.

use serde::{Deserialize, Serialize};

use hive_core::{HypervisorSettings, VirtualMachineId};
use hivegrid_state::VirtualMachineLocation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub virtual_machine_id: VirtualMachineId,
    pub source: VirtualMachineLocation,
    pub destination: VirtualMachineLocation,
    /// How the destination's hypervisor accepts the incoming VM.
    pub destination_hypervisor: HypervisorSettings,
    /// Set by the worker once the actuator confirmed the migration.
    #[serde(default)]
    pub migrated: bool,
}

impl MigrationRequest {
    pub fn new(
        virtual_machine_id: &str,
        source: VirtualMachineLocation,
        destination: VirtualMachineLocation,
        destination_hypervisor: HypervisorSettings,
    ) -> Self {
        Self {
            virtual_machine_id: virtual_machine_id.to_string(),
            source,
            destination,
            destination_hypervisor,
            migrated: false,
        }
    }

    pub fn source_local_controller(&self) -> Option<&str> {
        self.source.local_controller_id.as_deref()
    }

    pub fn destination_local_controller(&self) -> Option<&str> {
        self.destination.local_controller_id.as_deref()
    }
}
