//! Periodic consolidation: compute a reconfiguration plan over every local
//! controller of this group manager and enforce it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use hive_core::{Event, EventKind, Notifier};
use hivegrid_migration::{EnforcementReport, PlanEnforcer};
use hivegrid_placement::ReconfigurationPolicy;
use hivegrid_state::Repository;

use crate::error::ManagerResult;

pub struct ReconfigurationLoop {
    repository: Arc<dyn Repository>,
    policy: ReconfigurationPolicy,
    enforcer: Arc<PlanEnforcer>,
    notifier: Notifier,
    node_id: String,
    interval: Duration,
    history_depth: usize,
}

impl ReconfigurationLoop {
    pub fn new(
        policy: ReconfigurationPolicy,
        enforcer: Arc<PlanEnforcer>,
        notifier: Notifier,
        node_id: &str,
        interval: Duration,
        history_depth: usize,
    ) -> Self {
        Self {
            repository: Arc::clone(enforcer.repository()),
            policy,
            enforcer,
            notifier,
            node_id: node_id.to_string(),
            interval,
            history_depth,
        }
    }

    /// One consolidation pass. `None` when the configuration is already
    /// minimal.
    pub async fn run_once(&self) -> ManagerResult<Option<EnforcementReport>> {
        let local_controllers = self
            .repository
            .get_local_controller_descriptions(self.history_depth)?;
        let virtual_machines = self.repository.get_virtual_machines(self.history_depth)?;

        let plan = self.policy.reconfigure(local_controllers, virtual_machines);
        if plan.is_empty() {
            debug!("nothing to consolidate");
            return Ok(None);
        }
        info!(
            migrations = plan.number_of_migrations(),
            released = plan.released_nodes,
            "consolidating"
        );
        self.notifier
            .notify(Event::new(EventKind::Reconfiguration, &self.node_id, &plan));
        Ok(Some(self.enforcer.enforce(&plan).await))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "reconfiguration loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "consolidation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconfiguration loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hive_core::CapacityVector;
    use hive_core::config::{EstimatorConfig, ReconfigurationConfig, ThresholdsConfig};
    use hivegrid_estimator::ResourceDemandEstimator;
    use hivegrid_migration::{MigrationWorker, SimulatedActuator};
    use hivegrid_state::{LocalControllerDescription, StateStore, VirtualMachineMetaData};

    fn looper(store: &StateStore) -> ReconfigurationLoop {
        let estimator = Arc::new(
            ResourceDemandEstimator::new(&EstimatorConfig::default(), ThresholdsConfig::default())
                .unwrap(),
        );
        let worker = Arc::new(MigrationWorker::new(
            Arc::new(SimulatedActuator::new()),
            Duration::from_secs(1),
        ));
        let notifier = Notifier::open(8);
        let enforcer = Arc::new(PlanEnforcer::new(Arc::new(store.clone()), worker, notifier.clone(), "gm-1"));
        let policy = ReconfigurationPolicy::new(estimator, &ReconfigurationConfig::default());
        ReconfigurationLoop::new(policy, enforcer, notifier, "gm-1", Duration::from_millis(20), 10)
    }

    fn spread_cluster() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["lc-1", "lc-2"] {
            let mut lc = LocalControllerDescription::new(id, &format!("{id}:5000"), CapacityVector::from_slice(&[10.0, 10.0]));
            lc.monitoring.insert(1, CapacityVector::from_slice(&[2.0, 2.0]));
            store.put_local_controller(&lc).unwrap();
        }
        for (vm, lc) in [("vm-1", "lc-1"), ("vm-2", "lc-2")] {
            let mut meta = VirtualMachineMetaData::new(vm, CapacityVector::from_slice(&[2.0, 2.0]));
            meta.monitoring.insert(1, CapacityVector::from_slice(&[2.0, 2.0]));
            store.put_virtual_machine(&meta).unwrap();
            store.assign_virtual_machine(vm, lc).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn consolidates_then_settles() {
        let store = spread_cluster();
        let looper = looper(&store);

        let report = looper.run_once().await.unwrap().unwrap();
        assert_eq!(report.succeeded.len(), 1);
        assert!(report.failed.is_empty());

        let hosts: Vec<String> = ["vm-1", "vm-2"]
            .iter()
            .map(|vm| {
                store
                    .get_virtual_machine(vm, 0)
                    .unwrap()
                    .unwrap()
                    .location
                    .local_controller_id
                    .unwrap()
            })
            .collect();
        assert_eq!(hosts[0], hosts[1]);

        assert!(looper.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let looper = looper(&store);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { looper.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
