//! Single-VM lifecycle commands issued by a group manager.

use std::sync::Arc;

use tracing::{info, warn};

use hive_core::{Event, Notifier, VirtualMachineStatus};
use hivegrid_placement::ReconfigurationPlan;
use hivegrid_state::{
    CommitOutcome, LocalControllerDescription, Repository, VirtualMachineMetaData,
};

use crate::enforcer::PlanEnforcer;
use crate::error::{MigrationError, MigrationResult};
use crate::lifecycle::VirtualMachineCommand;

pub struct VirtualMachineController {
    repository: Arc<dyn Repository>,
    enforcer: Arc<PlanEnforcer>,
    notifier: Notifier,
    node_id: String,
}

impl VirtualMachineController {
    pub fn new(enforcer: Arc<PlanEnforcer>, notifier: Notifier, node_id: &str) -> Self {
        Self {
            repository: Arc::clone(enforcer.repository()),
            enforcer,
            notifier,
            node_id: node_id.to_string(),
        }
    }

    /// Run `command` against the VM and return its resulting status.
    ///
    /// The intermediate status is persisted before the actuator is called,
    /// unless it is terminal. A failed call restores the previous status.
    /// `Start` here only applies to VMs pinned to a local controller; use
    /// [`VirtualMachineController::start_on`] to choose one.
    pub async fn execute(
        &self,
        vm_id: &str,
        command: VirtualMachineCommand,
    ) -> MigrationResult<VirtualMachineStatus> {
        match &command {
            VirtualMachineCommand::Migrate { destination } => {
                self.migrate(vm_id, destination).await?;
                return Ok(VirtualMachineStatus::Running);
            }
            VirtualMachineCommand::Start => {
                let vm = self.load(vm_id)?;
                let Some(lc_id) = vm.local_controller_id() else {
                    return Err(MigrationError::NotHosted(vm_id.to_string()));
                };
                return self.start_on(vm_id, lc_id).await;
            }
            _ => {}
        }

        let vm = self.load(vm_id)?;
        let intermediate = command.begin(vm.status)?;
        let address = self.address_of(&vm)?;

        if !intermediate.is_terminal() {
            self.repository
                .update_virtual_machine_status(vm_id, intermediate, None)?;
        }
        self.notifier
            .notify(Event::new(command.event_kind(), &self.node_id, &vm));

        if let Err(e) = self.actuate(&command, &address, &vm).await {
            warn!(vm = %vm_id, command = command.name(), error = %e, "command failed");
            self.repository
                .update_virtual_machine_status(vm_id, vm.status, vm.error_code.clone())?;
            return Err(e.into());
        }

        let done = command.complete();
        match &command {
            VirtualMachineCommand::Resize { capacity } => {
                let mut resized = self.load(vm_id)?;
                resized.requested_capacity = capacity.clone();
                resized.status = done;
                self.repository.put_virtual_machine(&resized)?;
            }
            _ => {
                self.repository
                    .update_virtual_machine_status(vm_id, done, None)?;
            }
        }
        if let Some(kind) = command.completion_event_kind() {
            self.notifier.notify(Event::new(kind, &self.node_id, &vm));
        }
        info!(vm = %vm_id, command = command.name(), status = %done, "command completed");
        Ok(done)
    }

    /// Start an `Init` VM on `local_controller_id` and bind it there. The
    /// VM stays `Init` until the controller confirms the start.
    pub async fn start_on(
        &self,
        vm_id: &str,
        local_controller_id: &str,
    ) -> MigrationResult<VirtualMachineStatus> {
        let vm = self.load(vm_id)?;
        let command = VirtualMachineCommand::Start;
        command.begin(vm.status)?;
        let lc = self.local_controller(local_controller_id)?;

        self.notifier
            .notify(Event::new(command.event_kind(), &self.node_id, &vm));
        if let Err(e) = self.actuate(&command, &lc.control_address, &vm).await {
            warn!(vm = %vm_id, local_controller = %lc.id, error = %e, "start failed");
            return Err(e.into());
        }
        if let CommitOutcome::Stale { reason } = self.repository.assign_virtual_machine(vm_id, &lc.id)? {
            return Err(MigrationError::Unbound {
                vm: vm_id.to_string(),
                reason,
            });
        }
        info!(vm = %vm_id, local_controller = %lc.id, "vm started");
        Ok(command.complete())
    }

    /// Live-migrate one VM through the regular enforcement path.
    pub async fn migrate(&self, vm_id: &str, destination: &str) -> MigrationResult<()> {
        let vm = self.load(vm_id)?;
        let Some(source) = vm.local_controller_id() else {
            return Err(MigrationError::NotHosted(vm_id.to_string()));
        };
        VirtualMachineCommand::Migrate {
            destination: destination.to_string(),
        }
        .begin(vm.status)?;
        if self.repository.get_local_controller(destination, 0)?.is_none() {
            return Err(MigrationError::LocalControllerNotFound(destination.to_string()));
        }

        let plan = ReconfigurationPlan::single(vm_id, source, destination);
        let report = self.enforcer.enforce(&plan).await;
        if report.succeeded.iter().any(|id| id == vm_id) {
            return Ok(());
        }
        let reason = report
            .failed
            .into_iter()
            .chain(report.skipped)
            .find(|(id, _)| id == vm_id)
            .map(|(_, reason)| reason)
            .unwrap_or_else(|| "not attempted".to_string());
        Err(MigrationError::MigrationFailed {
            vm: vm_id.to_string(),
            reason,
        })
    }

    async fn actuate(
        &self,
        command: &VirtualMachineCommand,
        address: &str,
        vm: &VirtualMachineMetaData,
    ) -> crate::error::ActuatorResult<()> {
        let actuator = self.enforcer.worker().actuator();
        match command {
            VirtualMachineCommand::Start => actuator.start(address, vm).await,
            VirtualMachineCommand::Suspend => actuator.suspend(address, &vm.id).await,
            VirtualMachineCommand::Resume => actuator.resume(address, &vm.id).await,
            VirtualMachineCommand::Shutdown => actuator.shutdown(address, &vm.id).await,
            VirtualMachineCommand::Reboot => actuator.reboot(address, &vm.id).await,
            VirtualMachineCommand::Destroy => actuator.destroy(address, &vm.id).await,
            VirtualMachineCommand::Resize { capacity } => {
                actuator.resize(address, &vm.id, capacity).await
            }
            // routed through the enforcer in `execute`
            VirtualMachineCommand::Migrate { .. } => Ok(()),
        }
    }

    fn load(&self, vm_id: &str) -> MigrationResult<VirtualMachineMetaData> {
        self.repository
            .get_virtual_machine(vm_id, 0)?
            .ok_or_else(|| MigrationError::NotFound(vm_id.to_string()))
    }

    fn address_of(&self, vm: &VirtualMachineMetaData) -> MigrationResult<String> {
        let Some(lc_id) = vm.local_controller_id() else {
            return Err(MigrationError::NotHosted(vm.id.clone()));
        };
        Ok(self.local_controller(lc_id)?.control_address)
    }

    fn local_controller(&self, lc_id: &str) -> MigrationResult<LocalControllerDescription> {
        self.repository
            .get_local_controller(lc_id, 0)?
            .ok_or_else(|| MigrationError::LocalControllerNotFound(lc_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hive_core::{CapacityVector, EventKind};
    use hivegrid_state::StateStore;

    use crate::actuator::SimulatedActuator;
    use crate::worker::MigrationWorker;

    fn setup() -> (StateStore, Arc<SimulatedActuator>, Notifier, VirtualMachineController) {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["lc-1", "lc-2"] {
            store
                .put_local_controller(&LocalControllerDescription::new(
                    id,
                    &format!("{id}:5000"),
                    CapacityVector::from_slice(&[8.0, 8.0]),
                ))
                .unwrap();
        }
        store
            .put_virtual_machine(&VirtualMachineMetaData::new("vm-1", CapacityVector::from_slice(&[1.0, 1.0])))
            .unwrap();
        store.assign_virtual_machine("vm-1", "lc-1").unwrap();

        let actuator = Arc::new(SimulatedActuator::new());
        let notifier = Notifier::open(32);
        let worker = Arc::new(MigrationWorker::new(actuator.clone(), Duration::from_secs(1)));
        let enforcer = Arc::new(PlanEnforcer::new(
            Arc::new(store.clone()),
            worker,
            notifier.clone(),
            "gm-1",
        ));
        let controller = VirtualMachineController::new(enforcer, notifier.clone(), "gm-1");
        (store, actuator, notifier, controller)
    }

    fn status(store: &StateStore, vm: &str) -> VirtualMachineStatus {
        store.get_virtual_machine(vm, 0).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn suspend_then_resume() {
        let (store, actuator, _, controller) = setup();

        let s = controller.execute("vm-1", VirtualMachineCommand::Suspend).await.unwrap();
        assert_eq!(s, VirtualMachineStatus::Suspended);
        assert_eq!(status(&store, "vm-1"), VirtualMachineStatus::Suspended);

        controller.execute("vm-1", VirtualMachineCommand::Resume).await.unwrap();
        assert_eq!(status(&store, "vm-1"), VirtualMachineStatus::Running);

        let commands: Vec<&str> = actuator.calls().iter().map(|c| c.command).collect();
        assert_eq!(commands, vec!["suspend", "resume"]);
    }

    #[tokio::test]
    async fn free_vm_starts_on_the_chosen_controller() {
        let (store, actuator, _, controller) = setup();
        store
            .put_virtual_machine(&VirtualMachineMetaData::new("vm-new", CapacityVector::from_slice(&[1.0, 1.0])))
            .unwrap();

        let err = controller
            .execute("vm-new", VirtualMachineCommand::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::NotHosted(_)));
        assert!(matches!(
            controller.start_on("vm-new", "lc-9").await,
            Err(MigrationError::LocalControllerNotFound(_))
        ));

        let s = controller.start_on("vm-new", "lc-2").await.unwrap();
        assert_eq!(s, VirtualMachineStatus::Running);
        let vm = store.get_virtual_machine("vm-new", 0).unwrap().unwrap();
        assert_eq!(vm.local_controller_id(), Some("lc-2"));
        assert!(store.get_local_controller("lc-2", 0).unwrap().unwrap().hosts("vm-new"));
        assert_eq!(actuator.calls()[0].address, "lc-2:5000");
    }

    #[tokio::test]
    async fn failed_start_keeps_vm_init() {
        let (store, actuator, _, controller) = setup();
        store
            .put_virtual_machine(&VirtualMachineMetaData::new("vm-new", CapacityVector::from_slice(&[1.0, 1.0])))
            .unwrap();
        actuator.fail_for("vm-new");

        assert!(controller.start_on("vm-new", "lc-1").await.is_err());
        assert_eq!(status(&store, "vm-new"), VirtualMachineStatus::Init);
        assert!(!store.get_local_controller("lc-1", 0).unwrap().unwrap().hosts("vm-new"));
    }

    #[tokio::test]
    async fn invalid_command_touches_nothing() {
        let (store, actuator, _, controller) = setup();
        let err = controller
            .execute("vm-1", VirtualMachineCommand::Resume)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Lifecycle(_)));
        assert_eq!(status(&store, "vm-1"), VirtualMachineStatus::Running);
        assert!(actuator.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_command_restores_status() {
        let (store, actuator, _, controller) = setup();
        actuator.fail_for("vm-1");
        let err = controller
            .execute("vm-1", VirtualMachineCommand::Shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Actuator(_)));
        assert_eq!(status(&store, "vm-1"), VirtualMachineStatus::Running);
    }

    #[tokio::test]
    async fn destroy_terminates_and_detaches() {
        let (store, _, notifier, controller) = setup();
        let mut events = notifier.subscribe();

        let s = controller.execute("vm-1", VirtualMachineCommand::Destroy).await.unwrap();
        assert_eq!(s, VirtualMachineStatus::Terminated);
        assert!(!store.get_local_controller("lc-1", 0).unwrap().unwrap().hosts("vm-1"));

        assert_eq!(events.recv().await.unwrap().kind, EventKind::Destroy);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Destroyed);
    }

    #[tokio::test]
    async fn resize_updates_requested_capacity() {
        let (store, _, _, controller) = setup();
        let capacity = CapacityVector::from_slice(&[2.0, 4.0]);
        controller
            .execute("vm-1", VirtualMachineCommand::Resize { capacity: capacity.clone() })
            .await
            .unwrap();
        let vm = store.get_virtual_machine("vm-1", 0).unwrap().unwrap();
        assert_eq!(vm.requested_capacity, capacity);
        assert_eq!(vm.status, VirtualMachineStatus::Running);
    }

    #[tokio::test]
    async fn migrate_moves_the_vm() {
        let (store, _, _, controller) = setup();
        let s = controller
            .execute("vm-1", VirtualMachineCommand::Migrate { destination: "lc-2".into() })
            .await
            .unwrap();
        assert_eq!(s, VirtualMachineStatus::Running);
        let vm = store.get_virtual_machine("vm-1", 0).unwrap().unwrap();
        assert_eq!(vm.local_controller_id(), Some("lc-2"));
    }

    #[tokio::test]
    async fn failed_migration_is_an_error() {
        let (store, actuator, _, controller) = setup();
        actuator.fail_for("vm-1");
        let err = controller.migrate("vm-1", "lc-2").await.unwrap_err();
        assert!(matches!(err, MigrationError::MigrationFailed { .. }));
        let vm = store.get_virtual_machine("vm-1", 0).unwrap().unwrap();
        assert_eq!(vm.local_controller_id(), Some("lc-1"));
        assert_eq!(vm.status, VirtualMachineStatus::Running);
    }

    #[tokio::test]
    async fn unknown_destination_is_rejected() {
        let (_, _, _, controller) = setup();
        let err = controller.migrate("vm-1", "lc-9").await.unwrap_err();
        assert!(matches!(err, MigrationError::LocalControllerNotFound(_)));
    }
}
