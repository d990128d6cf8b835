//! Liveness of the local controllers a group manager owns.
//!
//! Local controllers are asked whether they are up on every tick. A
//! controller that answers has its last heartbeat moved to now; one that
//! stops answering ages out and is failed by the membership reaper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hive_core::clock::epoch_millis;
use hivegrid_migration::VirtualMachineActuator;
use hivegrid_state::Repository;

use crate::error::ManagerResult;

pub struct HostLivenessMonitor {
    repository: Arc<dyn Repository>,
    actuator: Arc<dyn VirtualMachineActuator>,
    group_manager_id: String,
    interval: Duration,
}

impl HostLivenessMonitor {
    pub fn new(
        repository: Arc<dyn Repository>,
        actuator: Arc<dyn VirtualMachineActuator>,
        group_manager_id: &str,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            actuator,
            group_manager_id: group_manager_id.to_string(),
            interval,
        }
    }

    /// Ask every owned local controller once, concurrently. Returns the ids
    /// that answered, sorted.
    pub async fn check_once(&self) -> ManagerResult<Vec<String>> {
        let hosts = self
            .repository
            .get_local_controller_descriptions(0)?
            .into_iter()
            .filter(|lc| lc.group_manager_id.as_deref() == Some(self.group_manager_id.as_str()));

        let mut checks = JoinSet::new();
        for lc in hosts {
            let actuator = Arc::clone(&self.actuator);
            checks.spawn(async move {
                let active = actuator.is_active(&lc.control_address).await;
                (lc.id, lc.control_address, active)
            });
        }

        let mut alive = Vec::new();
        while let Some(joined) = checks.join_next().await {
            let (id, address, active) = match joined {
                Ok(checked) => checked,
                Err(e) => {
                    warn!(error = %e, "liveness check task failed");
                    continue;
                }
            };
            if !active {
                debug!(local_controller = %id, %address, "local controller not answering");
                continue;
            }
            match self.repository.refresh_local_controller(&id, epoch_millis()) {
                Ok(true) => alive.push(id),
                // reaped or removed while the check was in flight
                Ok(false) => {}
                Err(e) => warn!(local_controller = %id, error = %e, "could not record liveness"),
            }
        }
        alive.sort();
        Ok(alive)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            group_manager = %self.group_manager_id,
            interval_ms = self.interval.as_millis() as u64,
            "host liveness monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        warn!(error = %e, "host liveness check failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("host liveness monitor stopping");
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
    use hivegrid_migration::SimulatedActuator;
    use hivegrid_state::{LocalControllerDescription, StateStore};

    fn host(store: &StateStore, id: &str, group_manager: &str, last_heartbeat: u64) {
        let mut lc = LocalControllerDescription::new(id, &format!("{id}:5000"), CapacityVector::from_slice(&[8.0, 8.0]));
        lc.group_manager_id = Some(group_manager.to_string());
        lc.last_heartbeat = last_heartbeat;
        store.put_local_controller(&lc).unwrap();
    }

    fn last_heartbeat(store: &StateStore, id: &str) -> u64 {
        store.get_local_controller(id, 0).unwrap().unwrap().last_heartbeat
    }

    #[tokio::test]
    async fn answering_hosts_are_marked_alive() {
        let store = StateStore::open_in_memory().unwrap();
        host(&store, "lc-1", "gm-1", 1_000);
        host(&store, "lc-2", "gm-1", 1_000);
        host(&store, "lc-3", "gm-2", 1_000);
        let actuator = Arc::new(SimulatedActuator::new());
        actuator.disconnect("lc-2:5000");
        let monitor = HostLivenessMonitor::new(
            Arc::new(store.clone()),
            actuator,
            "gm-1",
            Duration::from_millis(50),
        );

        let before = epoch_millis();
        assert_eq!(monitor.check_once().await.unwrap(), vec!["lc-1"]);
        assert!(last_heartbeat(&store, "lc-1") >= before);
        // silent and foreign hosts keep their old timestamp
        assert_eq!(last_heartbeat(&store, "lc-2"), 1_000);
        assert_eq!(last_heartbeat(&store, "lc-3"), 1_000);
    }

    #[tokio::test]
    async fn monitor_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        host(&store, "lc-1", "gm-1", 0);
        let monitor = HostLivenessMonitor::new(
            Arc::new(store.clone()),
            Arc::new(SimulatedActuator::new()),
            "gm-1",
            Duration::from_millis(10),
        );
        let (stop_tx, stop) = watch::channel(false);
        let running = tokio::spawn(async move { monitor.run(stop).await });

        tokio::time::sleep(Duration::from_millis(40)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(last_heartbeat(&store, "lc-1") > 0);
    }
}
