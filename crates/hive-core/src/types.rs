//! Identifiers and small enums shared across HiveGrid crates.

use serde::{Deserialize, Serialize};

/// Unique identifier for a virtual machine.
pub type VirtualMachineId = String;

/// Unique identifier for a local controller (one per physical host).
pub type LocalControllerId = String;

/// Unique identifier for a group manager.
pub type GroupManagerId = String;

/// Lifecycle status of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualMachineStatus {
    /// Submitted, not yet started on any host.
    Init,
    Running,
    Suspended,
    Migrating,
    Rebooting,
    ShuttingDown,
    Destroyed,
    /// Gone for good (after shutdown or destroy completed).
    Terminated,
    Error,
}

impl VirtualMachineStatus {
    /// Whether the VM no longer exists on any host.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VirtualMachineStatus::Destroyed | VirtualMachineStatus::Terminated
        )
    }

    /// Whether a lifecycle operation is currently in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            VirtualMachineStatus::Migrating
                | VirtualMachineStatus::Rebooting
                | VirtualMachineStatus::ShuttingDown
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            VirtualMachineStatus::Init => "INIT",
            VirtualMachineStatus::Running => "RUNNING",
            VirtualMachineStatus::Suspended => "SUSPENDED",
            VirtualMachineStatus::Migrating => "MIGRATING",
            VirtualMachineStatus::Rebooting => "REBOOTING",
            VirtualMachineStatus::ShuttingDown => "SHUTTING_DOWN",
            VirtualMachineStatus::Destroyed => "DESTROYED",
            VirtualMachineStatus::Terminated => "TERMINATED",
            VirtualMachineStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for VirtualMachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Power status of a local controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerStatus {
    #[default]
    Active,
    /// Powered down or suspended to save energy; capacity is reserved, not usable.
    Passive,
}

/// Load state of a local controller as judged by an anomaly detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalControllerState {
    Stable,
    Overloaded,
    Underloaded,
}

/// Addresses a component listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListenSettings {
    /// Control-plane address (ip:port) for commands.
    pub control_data_address: String,
    /// Address monitoring data is pushed to.
    pub monitoring_data_address: String,
}

/// Hypervisor connection settings on a migration destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    /// Hypervisor driver, e.g. "qemu" or "xen".
    pub driver: String,
    /// Migration transport, e.g. "tcp" or "ssh".
    pub transport: String,
    pub port: u16,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            driver: "qemu".to_string(),
            transport: "tcp".to_string(),
            port: 16509,
        }
    }
}
