//! Anomaly detection on local controllers.
//!
//! Detectors are looked up by name from a static registry. The runner polls
//! every local controller on a fixed interval, hands the recent monitoring
//! window to the detector, and forwards every overload or underload to the
//! resolver channel.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use hive_core::clock::epoch_millis;
use hive_core::config::AnomalyConfig;
use hive_core::{Event, EventKind, LocalControllerState, Notifier};
use hivegrid_estimator::ResourceDemandEstimator;
use hivegrid_state::{LocalControllerDescription, Repository, VirtualMachineMetaData};

use crate::error::{ManagerError, ManagerResult};

/// Names accepted by [`detector_for`].
pub const DETECTORS: &[&str] = &["threshold", "noop"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyEvent {
    pub local_controller_id: String,
    pub state: LocalControllerState,
    /// Epoch millis.
    pub detected_at: u64,
}

pub trait AnomalyDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Judge one host from its recent monitoring window. `None` means there
    /// is not enough data to decide.
    fn detect_anomaly(
        &self,
        host: &LocalControllerDescription,
        virtual_machines: &[VirtualMachineMetaData],
    ) -> anyhow::Result<Option<LocalControllerState>>;
}

/// Compares aggregated host usage against the configured thresholds.
pub struct ThresholdAnomalyDetector {
    estimator: Arc<ResourceDemandEstimator>,
}

impl ThresholdAnomalyDetector {
    pub fn new(estimator: Arc<ResourceDemandEstimator>) -> Self {
        Self { estimator }
    }
}

impl AnomalyDetector for ThresholdAnomalyDetector {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn detect_anomaly(
        &self,
        host: &LocalControllerDescription,
        virtual_machines: &[VirtualMachineMetaData],
    ) -> anyhow::Result<Option<LocalControllerState>> {
        if host.monitoring.is_empty() {
            return Ok(None);
        }
        let dimensions = host.total_capacity.dimensions();
        if let Some(sample) = host
            .monitoring
            .values()
            .find(|sample| sample.dimensions() != dimensions)
        {
            anyhow::bail!(
                "{} reports {} dimensions against a capacity of {}",
                host.id,
                sample.dimensions(),
                dimensions
            );
        }

        if self.estimator.is_local_controller_overloaded(host) {
            return Ok(Some(LocalControllerState::Overloaded));
        }
        // an idle host has nothing to evacuate
        if !virtual_machines.is_empty() && self.estimator.is_local_controller_underloaded(host) {
            return Ok(Some(LocalControllerState::Underloaded));
        }
        Ok(Some(LocalControllerState::Stable))
    }
}

pub struct NoopAnomalyDetector;

impl AnomalyDetector for NoopAnomalyDetector {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn detect_anomaly(
        &self,
        _host: &LocalControllerDescription,
        _virtual_machines: &[VirtualMachineMetaData],
    ) -> anyhow::Result<Option<LocalControllerState>> {
        Ok(None)
    }
}

pub fn detector_for(
    name: &str,
    estimator: Arc<ResourceDemandEstimator>,
) -> ManagerResult<Arc<dyn AnomalyDetector>> {
    match name {
        "threshold" => Ok(Arc::new(ThresholdAnomalyDetector::new(estimator))),
        "noop" => Ok(Arc::new(NoopAnomalyDetector)),
        other => Err(ManagerError::UnknownDetector(other.to_string())),
    }
}

pub struct AnomalyDetectorRunner {
    repository: Arc<dyn Repository>,
    detector: Arc<dyn AnomalyDetector>,
    events: mpsc::Sender<AnomalyEvent>,
    notifier: Notifier,
    node_id: String,
    interval: Duration,
    number_of_monitoring_entries: usize,
}

impl AnomalyDetectorRunner {
    pub fn new(
        repository: Arc<dyn Repository>,
        detector: Arc<dyn AnomalyDetector>,
        config: &AnomalyConfig,
        events: mpsc::Sender<AnomalyEvent>,
        notifier: Notifier,
        node_id: &str,
    ) -> Self {
        Self {
            repository,
            detector,
            events,
            notifier,
            node_id: node_id.to_string(),
            interval: config.interval(),
            number_of_monitoring_entries: config.number_of_monitoring_entries,
        }
    }

    /// One pass over every active local controller.
    pub fn detect_once(&self) -> ManagerResult<Vec<AnomalyEvent>> {
        let depth = self.number_of_monitoring_entries;
        let mut anomalies = Vec::new();

        for host in self.repository.get_local_controller_descriptions(depth)? {
            if !host.is_active() {
                continue;
            }
            let vms = self.repository.get_virtual_machines_on(&host.id, depth)?;
            let state = match self.detector.detect_anomaly(&host, &vms) {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    warn!(detector = self.detector.name(), local_controller = %host.id, error = %e, "anomaly detection failed");
                    continue;
                }
            };
            if state == LocalControllerState::Stable {
                continue;
            }

            let event = AnomalyEvent {
                local_controller_id: host.id.clone(),
                state,
                detected_at: epoch_millis(),
            };
            info!(local_controller = %host.id, ?state, "anomaly detected");
            self.notifier
                .notify(Event::new(EventKind::Anomaly, &self.node_id, &event));
            match self.events.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(local_controller = %host.id, "resolver busy, anomaly dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(local_controller = %host.id, "anomaly resolver is gone");
                }
            }
            anomalies.push(event);
        }
        Ok(anomalies)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            detector = self.detector.name(),
            interval = ?self.interval,
            "anomaly detector started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.detect_once() {
                        warn!(error = %e, "anomaly pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("anomaly detector shutting down");
                    break;
                }
            }
        }
    }
}
