//! Summary producer: aggregates local controller capacity into the group
//! manager summary the group leader dispatches against.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use hive_core::clock::epoch_millis;
use hive_core::{Event, EventKind, Notifier};
use hivegrid_estimator::ResourceDemandEstimator;
use hivegrid_state::{GroupManagerDescription, GroupManagerSummary, Repository};

use crate::error::ManagerResult;

pub struct SummaryProducer {
    repository: Arc<dyn Repository>,
    estimator: Arc<ResourceDemandEstimator>,
    description: GroupManagerDescription,
    notifier: Notifier,
    interval: Duration,
}

impl SummaryProducer {
    /// `description` identifies this group manager; its summary history is
    /// ignored.
    pub fn new(
        repository: Arc<dyn Repository>,
        estimator: Arc<ResourceDemandEstimator>,
        description: GroupManagerDescription,
        notifier: Notifier,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            estimator,
            description: description.with_history_depth(0),
            notifier,
            interval,
        }
    }

    pub fn summarize(&self) -> ManagerResult<GroupManagerSummary> {
        let depth = self.estimator.number_of_monitoring_entries();
        let mut summary = GroupManagerSummary::default();

        for lc in self.repository.get_local_controller_descriptions(depth)? {
            if lc.group_manager_id.as_deref().is_some_and(|gm| gm != self.description.id) {
                continue;
            }
            summary.local_controllers += 1;
            summary.virtual_machines += lc.virtual_machines.len() as u32;
            let total = self.estimator.compute_local_controller_total_capacity(&lc);
            if lc.is_active() {
                summary.active_capacity.accumulate(&total);
                summary
                    .used_capacity
                    .accumulate(&self.estimator.compute_local_controller_used_capacity(&lc));
            } else {
                summary.passive_capacity.accumulate(&total);
            }
        }
        Ok(summary)
    }

    /// Summarize and store under `now_ms`, registering this group manager
    /// on first use.
    pub fn produce(&self, now_ms: u64) -> ManagerResult<GroupManagerSummary> {
        let summary = self.summarize()?;
        let id = self.description.id.as_str();
        if !self
            .repository
            .add_group_manager_summary(id, now_ms, summary.clone())?
        {
            let mut description = self.description.clone();
            description.summaries.insert(now_ms, summary.clone());
            description.last_seen = now_ms;
            self.repository.add_group_manager_description(&description)?;
            debug!(group_manager = %id, "group manager registered");
        }
        self.notifier
            .notify(Event::new(EventKind::Summary, id, &summary));
        Ok(summary)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(group_manager = %self.description.id, interval = ?self.interval, "summary producer started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.produce(epoch_millis()) {
                        warn!(error = %e, "summary production failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("summary producer stopping");
                    break;
                }
            }
        }
    }
}
