//! VM lifecycle commands and the status transitions they are allowed from.
//!
//! A command moves a VM into an intermediate status while the actuator
//! works, then into its completion status on success. On failure the VM
//! returns to the status it had before the command.

use serde::{Deserialize, Serialize};

use hive_core::{CapacityVector, EventKind, LocalControllerId, VirtualMachineStatus};

use crate::error::LifecycleError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum VirtualMachineCommand {
    Start,
    Suspend,
    Resume,
    Shutdown,
    Reboot,
    Destroy,
    Migrate { destination: LocalControllerId },
    Resize { capacity: CapacityVector },
}

impl VirtualMachineCommand {
    pub fn name(&self) -> &'static str {
        match self {
            VirtualMachineCommand::Start => "start",
            VirtualMachineCommand::Suspend => "suspend",
            VirtualMachineCommand::Resume => "resume",
            VirtualMachineCommand::Shutdown => "shutdown",
            VirtualMachineCommand::Reboot => "reboot",
            VirtualMachineCommand::Destroy => "destroy",
            VirtualMachineCommand::Migrate { .. } => "migrate",
            VirtualMachineCommand::Resize { .. } => "resize",
        }
    }

    /// The status held while the command runs, if `current` allows it.
    pub fn begin(&self, current: VirtualMachineStatus) -> Result<VirtualMachineStatus, LifecycleError> {
        use VirtualMachineStatus::*;
        let next = match (self, current) {
            (VirtualMachineCommand::Start, Init) => Running,
            (VirtualMachineCommand::Suspend, Running) => Suspended,
            (VirtualMachineCommand::Resume, Suspended) => Running,
            (VirtualMachineCommand::Shutdown, Running) => ShuttingDown,
            (VirtualMachineCommand::Reboot, Running) => Rebooting,
            (VirtualMachineCommand::Destroy, Init | Running | Suspended | Error) => Destroyed,
            (VirtualMachineCommand::Migrate { .. }, Running) => Migrating,
            (VirtualMachineCommand::Resize { .. }, Running) => Running,
            _ => {
                return Err(LifecycleError::InvalidTransition {
                    command: self.name(),
                    status: current,
                });
            }
        };
        Ok(next)
    }

    /// The status after the actuator reported success.
    pub fn complete(&self) -> VirtualMachineStatus {
        use VirtualMachineStatus::*;
        match self {
            VirtualMachineCommand::Start
            | VirtualMachineCommand::Resume
            | VirtualMachineCommand::Reboot
            | VirtualMachineCommand::Migrate { .. }
            | VirtualMachineCommand::Resize { .. } => Running,
            VirtualMachineCommand::Suspend => Suspended,
            VirtualMachineCommand::Shutdown | VirtualMachineCommand::Destroy => Terminated,
        }
    }

    /// Event emitted when the command is issued.
    pub fn event_kind(&self) -> EventKind {
        match self {
            VirtualMachineCommand::Start => EventKind::Start,
            VirtualMachineCommand::Suspend => EventKind::Suspend,
            VirtualMachineCommand::Resume => EventKind::Resume,
            VirtualMachineCommand::Shutdown => EventKind::Shutdown,
            VirtualMachineCommand::Reboot => EventKind::Reboot,
            VirtualMachineCommand::Destroy => EventKind::Destroy,
            VirtualMachineCommand::Migrate { .. } => EventKind::Migrate,
            VirtualMachineCommand::Resize { .. } => EventKind::Resize,
        }
    }

    /// Extra event emitted once the command completed, if any.
    pub fn completion_event_kind(&self) -> Option<EventKind> {
        match self {
            VirtualMachineCommand::Destroy => Some(EventKind::Destroyed),
            VirtualMachineCommand::Migrate { .. } => Some(EventKind::Migrated),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VirtualMachineStatus::*;

    #[test]
    fn valid_transitions() {
        assert_eq!(VirtualMachineCommand::Start.begin(Init), Ok(Running));
        assert_eq!(VirtualMachineCommand::Suspend.begin(Running), Ok(Suspended));
        assert_eq!(VirtualMachineCommand::Resume.begin(Suspended), Ok(Running));
        assert_eq!(VirtualMachineCommand::Shutdown.begin(Running), Ok(ShuttingDown));
        assert_eq!(VirtualMachineCommand::Reboot.begin(Running), Ok(Rebooting));
        for status in [Init, Running, Suspended, Error] {
            assert_eq!(VirtualMachineCommand::Destroy.begin(status), Ok(Destroyed));
        }
        let migrate = VirtualMachineCommand::Migrate {
            destination: "lc-2".into(),
        };
        assert_eq!(migrate.begin(Running), Ok(Migrating));
        assert_eq!(migrate.complete(), Running);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(VirtualMachineCommand::Suspend.begin(Suspended).is_err());
        assert!(VirtualMachineCommand::Resume.begin(Running).is_err());
        assert!(VirtualMachineCommand::Destroy.begin(Migrating).is_err());
        assert!(VirtualMachineCommand::Start.begin(Terminated).is_err());

        let err = VirtualMachineCommand::Reboot.begin(Suspended).unwrap_err();
        assert_eq!(err.to_string(), "cannot reboot a vm that is SUSPENDED");
    }

    #[test]
    fn terminal_completions() {
        assert_eq!(VirtualMachineCommand::Shutdown.complete(), Terminated);
        assert_eq!(VirtualMachineCommand::Destroy.complete(), Terminated);
        assert_eq!(
            VirtualMachineCommand::Destroy.completion_event_kind(),
            Some(EventKind::Destroyed)
        );
    }

    #[test]
    fn commands_serialize_with_tag() {
        let json = serde_json::to_string(&VirtualMachineCommand::Migrate {
            destination: "lc-2".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"command":"migrate","destination":"lc-2"}"#);
    }
}
