//! Node assembly: opens the store, builds the policies and the migration
//! pipeline, and runs every group manager loop until shutdown.
//!
//! Every node is a group manager for the local controllers that joined it,
//! keeps them alive while they answer, and campaigns for group leadership. The leader additionally tracks group
//! manager heartbeats and dispatches pending submissions.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hive_core::clock::epoch_millis;
use hive_core::config::ActuatorMode;
use hive_core::{HiveConfig, ListenSettings, Notifier};
use hivegrid_cluster::{
    Coordinator, FileLeaseCoordinator, HeartbeatAnnouncer, HeartbeatMessage, HeartbeatReceiver,
    LeaderElection, MembershipTracker, StoreCoordinator,
};
use hivegrid_estimator::ResourceDemandEstimator;
use hivegrid_manager::{
    AnomalyDetectorRunner, AnomalyResolver, HostLivenessMonitor, ReconfigurationLoop,
    SubmissionService, SummaryProducer, detector_for,
};
use hivegrid_migration::{
    HttpActuator, MigrationWorker, PlanEnforcer, SimulatedActuator, VirtualMachineActuator,
};
use hivegrid_placement::{
    DispatchingPolicy, PlacementPolicy, ReconfigurationPolicy, RelocationPolicy,
};
use hivegrid_state::{GroupManagerDescription, Repository, StateStore};

use crate::duties::{LeadershipEvents, run_submissions, track_group_managers};

/// Lease row contended for by every group leader candidate.
pub const GROUP_LEADER_LEASE: &str = "group-leader";

/// Location of the state store inside a data directory.
pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("hivegrid.redb")
}

/// The coordinator the group leader election runs on. A lease kept in the
/// node's own store only arbitrates between candidates sharing that store,
/// so a node announcing to peers needs `election.lease_store`.
pub fn coordinator_for(config: &HiveConfig, store: &StateStore) -> anyhow::Result<Arc<dyn Coordinator>> {
    if let Some(path) = &config.election.lease_store {
        info!(path = %path, "group leader lease on shared file");
        return Ok(Arc::new(FileLeaseCoordinator::new(path, GROUP_LEADER_LEASE)));
    }
    if config.node.announces_to_peers() {
        anyhow::bail!(
            "heartbeats go to {} but election.lease_store is unset; every node would elect itself",
            config.node.heartbeat_address
        );
    }
    Ok(Arc::new(StoreCoordinator::new(store.clone(), GROUP_LEADER_LEASE)))
}

const NOTIFIER_CAPACITY: usize = 256;
const HEARTBEAT_QUEUE: usize = 64;
const ANOMALY_QUEUE: usize = 32;

pub struct Node {
    config: HiveConfig,
    store: StateStore,
    notifier: Notifier,
    actuator: Arc<dyn VirtualMachineActuator>,
}

impl Node {
    /// Open the store under `data_dir`, creating the directory if needed.
    pub fn open(config: HiveConfig, data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let path = store_path(data_dir);
        let store = StateStore::open(&path)
            .with_context(|| format!("opening state store {}", path.display()))?;
        info!(path = ?path, "state store opened");
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: HiveConfig, store: StateStore) -> Self {
        let actuator: Arc<dyn VirtualMachineActuator> = match config.actuator.mode {
            ActuatorMode::Http => Arc::new(HttpActuator::new(config.actuator.request_timeout())),
            ActuatorMode::Simulated => Arc::new(SimulatedActuator::new()),
        };
        Self {
            config,
            store,
            notifier: Notifier::open(NOTIFIER_CAPACITY),
            actuator,
        }
    }

    pub fn with_actuator(mut self, actuator: Arc<dyn VirtualMachineActuator>) -> Self {
        self.actuator = actuator;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Run until `shutdown` flips or the election gives up. Startup errors
    /// (bad estimator settings, unknown detector, a private lease with peer
    /// heartbeats, unreachable coordinator, heartbeat sockets) are returned
    /// before any loop starts.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Node {
            config,
            store,
            notifier,
            actuator,
        } = self;
        let node_id = config.node.id.clone();
        let repository: Arc<dyn Repository> = Arc::new(store.clone());

        let estimator = Arc::new(
            ResourceDemandEstimator::from_config(&config).context("invalid estimator settings")?,
        );
        let depth = estimator.number_of_monitoring_entries();
        let detector = detector_for(&config.anomaly.detector, Arc::clone(&estimator))?;

        let election = LeaderElection::new(
            coordinator_for(&config, &store)?,
            &node_id,
            &config.election,
        )
        .with_listener(Arc::new(LeadershipEvents::new(notifier.clone(), &node_id)));
        let leader = election
            .check_connectivity()
            .await
            .context("coordinator unreachable")?;
        info!(node = %node_id, current_leader = ?leader, "joining group leader election");

        let listen_settings = ListenSettings {
            control_data_address: config.node.control_address.clone(),
            monitoring_data_address: config.node.monitoring_address.clone(),
        };
        let receiver = HeartbeatReceiver::bind(&config.node.heartbeat_bind)
            .await
            .context("binding heartbeat listener")?;
        if let Ok(SocketAddr::V4(group)) = config.node.heartbeat_address.parse::<SocketAddr>()
            && group.ip().is_multicast()
        {
            receiver.join_multicast(*group.ip())?;
        }
        let announcer = HeartbeatAnnouncer::new(
            HeartbeatMessage::new(&node_id, listen_settings.clone(), &config.node.heartbeat_address),
            &config.node.heartbeat_address,
            config.heartbeat.interval(),
        )?;

        let liveness = HostLivenessMonitor::new(
            Arc::clone(&repository),
            Arc::clone(&actuator),
            &node_id,
            config.heartbeat.interval(),
        );
        let worker = Arc::new(MigrationWorker::new(actuator, config.actuator.migration_timeout()));
        let enforcer = Arc::new(
            PlanEnforcer::new(Arc::clone(&repository), worker, notifier.clone(), &node_id)
                .with_hypervisor(config.actuator.hypervisor.clone()),
        );

        // ── Background loops ───────────────────────────────────────
        let (stop_tx, stop) = watch::channel(false);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let (heartbeats, listener) = receiver.spawn(HEARTBEAT_QUEUE, stop.clone());
        handles.push(listener);
        let announcer_stop = stop.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = announcer.run(announcer_stop).await {
                warn!(error = %e, "heartbeat announcer stopped");
            }
        }));

        let membership = Arc::new(
            MembershipTracker::new(Arc::clone(&repository), notifier.clone(), &node_id)
                .with_dead_timeout(config.monitoring.dead_timeout())
                .watching_since(epoch_millis()),
        );
        handles.push(tokio::spawn(track_group_managers(
            Arc::clone(&membership),
            heartbeats,
            election.subscribe(),
            stop.clone(),
        )));
        let reaper_stop = stop.clone();
        let reap_interval = config.heartbeat.interval();
        handles.push(tokio::spawn(async move {
            membership.run(reap_interval, reaper_stop).await;
        }));

        let liveness_stop = stop.clone();
        handles.push(tokio::spawn(async move { liveness.run(liveness_stop).await }));

        let (anomalies_tx, anomalies) = mpsc::channel(ANOMALY_QUEUE);
        let runner = AnomalyDetectorRunner::new(
            Arc::clone(&repository),
            detector,
            &config.anomaly,
            anomalies_tx,
            notifier.clone(),
            &node_id,
        );
        let runner_stop = stop.clone();
        handles.push(tokio::spawn(async move { runner.run(runner_stop).await }));

        let resolver = Arc::new(AnomalyResolver::new(
            RelocationPolicy::new(Arc::clone(&estimator), &config.relocation),
            Arc::clone(&enforcer),
            notifier.clone(),
            &node_id,
            depth,
        ));
        handles.push(tokio::spawn(resolver.run(anomalies, stop.clone())));

        if config.reconfiguration.enabled {
            let consolidation = ReconfigurationLoop::new(
                ReconfigurationPolicy::new(Arc::clone(&estimator), &config.reconfiguration),
                Arc::clone(&enforcer),
                notifier.clone(),
                &node_id,
                config.reconfiguration.interval(),
                depth,
            );
            let consolidation_stop = stop.clone();
            handles.push(tokio::spawn(async move {
                consolidation.run(consolidation_stop).await
            }));
        } else {
            info!("reconfiguration disabled");
        }

        let mut description =
            GroupManagerDescription::new(&node_id, listen_settings, &config.node.heartbeat_address);
        description.hostname = config.node.hostname.clone();
        let summaries = SummaryProducer::new(
            Arc::clone(&repository),
            Arc::clone(&estimator),
            description,
            notifier.clone(),
            config.monitoring.summary_interval(),
        );
        let summary_stop = stop.clone();
        handles.push(tokio::spawn(async move { summaries.run(summary_stop).await }));

        let submissions = SubmissionService::new(
            DispatchingPolicy::new(Arc::clone(&estimator), &config.dispatching),
            PlacementPolicy::new(Arc::clone(&estimator), &config.placement),
            enforcer,
            depth,
        );
        handles.push(tokio::spawn(run_submissions(
            submissions,
            node_id.clone(),
            election.subscribe(),
            config.monitoring.summary_interval(),
            stop.clone(),
        )));

        info!(node = %node_id, tasks = handles.len(), "node running");

        // ── Election in the foreground ─────────────────────────────
        let outcome = election.run(shutdown).await;
        if let Err(e) = &outcome {
            warn!(error = %e, "election failed, stopping node");
        }

        let _ = stop_tx.send(true);
        for handle in handles {
            let _ = handle.await;
        }
        notifier.close();
        info!(node = %node_id, "node stopped");
        outcome.map_err(Into::into)
    }
}
