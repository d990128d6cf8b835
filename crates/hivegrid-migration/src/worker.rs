//! Migration worker: runs one migration request to completion.
//!
//! The worker asks the source local controller to migrate the VM, waits at
//! most the migration timeout, records the outcome in `migrated`, and then
//! tells every registered listener exactly once, from the worker's own task.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::actuator::VirtualMachineActuator;
use crate::request::MigrationRequest;

pub trait MigrationListener: Send + Sync {
    fn on_migration_ended(&self, request: &MigrationRequest);
}

pub struct MigrationWorker {
    actuator: Arc<dyn VirtualMachineActuator>,
    listeners: Vec<Arc<dyn MigrationListener>>,
    timeout: Duration,
}

impl MigrationWorker {
    pub fn new(actuator: Arc<dyn VirtualMachineActuator>, timeout: Duration) -> Self {
        Self {
            actuator,
            listeners: Vec::new(),
            timeout,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn MigrationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn actuator(&self) -> &Arc<dyn VirtualMachineActuator> {
        &self.actuator
    }

    pub async fn run(&self, mut request: MigrationRequest) -> MigrationRequest {
        request.migrated = self.migrate(&request).await;
        for listener in &self.listeners {
            listener.on_migration_ended(&request);
        }
        request
    }

    /// Run the request on its own task.
    pub fn spawn(self: &Arc<Self>, request: MigrationRequest) -> JoinHandle<MigrationRequest> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run(request).await })
    }

    async fn migrate(&self, request: &MigrationRequest) -> bool {
        let vm = request.virtual_machine_id.as_str();
        let Some(address) = request.source.local_controller_address.as_deref() else {
            warn!(%vm, "migration source has no control address");
            return false;
        };

        let call = self.actuator.migrate_virtual_machine(address, request);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => {
                info!(
                    %vm,
                    source = ?request.source_local_controller(),
                    destination = ?request.destination_local_controller(),
                    "migration completed"
                );
                true
            }
            Ok(Err(e)) => {
                warn!(%vm, error = %e, "migration failed");
                false
            }
            Err(_) => {
                warn!(%vm, timeout = ?self.timeout, "migration abandoned after timeout");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use hive_core::HypervisorSettings;
    use hivegrid_state::VirtualMachineLocation;

    use crate::actuator::SimulatedActuator;

    #[derive(Default)]
    struct Recorder {
        ended: Mutex<Vec<(String, bool)>>,
    }

    impl MigrationListener for Recorder {
        fn on_migration_ended(&self, request: &MigrationRequest) {
            self.ended
                .lock()
                .unwrap()
                .push((request.virtual_machine_id.clone(), request.migrated));
        }
    }

    fn request(vm: &str) -> MigrationRequest {
        MigrationRequest::new(
            vm,
            VirtualMachineLocation::on("gm-1", "lc-1", "lc-1:5000"),
            VirtualMachineLocation::on("gm-1", "lc-2", "lc-2:5000"),
            HypervisorSettings::default(),
        )
    }

    #[tokio::test]
    async fn success_sets_migrated_and_notifies_once() {
        let recorder = Arc::new(Recorder::default());
        let worker = Arc::new(
            MigrationWorker::new(Arc::new(SimulatedActuator::new()), Duration::from_secs(1))
                .with_listener(recorder.clone()),
        );

        let done = worker.spawn(request("vm-1")).await.unwrap();
        assert!(done.migrated);
        assert_eq!(*recorder.ended.lock().unwrap(), vec![("vm-1".to_string(), true)]);
    }

    #[tokio::test]
    async fn failure_is_reported_to_listener() {
        let actuator = Arc::new(SimulatedActuator::new());
        actuator.fail_for("vm-1");
        let recorder = Arc::new(Recorder::default());
        let worker = MigrationWorker::new(actuator, Duration::from_secs(1)).with_listener(recorder.clone());

        let done = worker.run(request("vm-1")).await;
        assert!(!done.migrated);
        assert_eq!(recorder.ended.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_migration_is_abandoned() {
        let actuator = Arc::new(SimulatedActuator::new().with_delay(Duration::from_secs(5)));
        let worker = MigrationWorker::new(actuator, Duration::from_millis(50));
        let done = worker.run(request("vm-1")).await;
        assert!(!done.migrated);
    }

    #[tokio::test]
    async fn missing_source_address_fails() {
        let worker = MigrationWorker::new(Arc::new(SimulatedActuator::new()), Duration::from_secs(1));
        let mut req = request("vm-1");
        req.source.local_controller_address = None;
        assert!(!worker.run(req).await.migrated);
    }
}
