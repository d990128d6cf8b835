//! Loops whose behaviour depends on the node's election role.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use hive_core::clock::epoch_millis;
use hive_core::{Event, EventKind, Notifier};
use hivegrid_cluster::{ElectionListener, HeartbeatMessage, MembershipTracker, Role};
use hivegrid_manager::SubmissionService;

/// Surfaces leadership changes of this node as group leader events.
pub struct LeadershipEvents {
    notifier: Notifier,
    node_id: String,
}

impl LeadershipEvents {
    pub fn new(notifier: Notifier, node_id: &str) -> Self {
        Self {
            notifier,
            node_id: node_id.to_string(),
        }
    }
}

impl ElectionListener for LeadershipEvents {
    fn on_elected(&self) {
        info!(node = %self.node_id, "acting as group leader");
        self.notifier
            .notify(Event::new(EventKind::GroupLeaderJoined, &self.node_id, &self.node_id));
    }

    fn on_demoted(&self) {
        warn!(node = %self.node_id, "group leadership lost");
        self.notifier
            .notify(Event::new(EventKind::GroupLeaderFailed, &self.node_id, &self.node_id));
    }
}

/// Feed group manager heartbeats into membership while this node leads.
/// Heartbeats heard as a follower are ignored.
pub async fn track_group_managers(
    membership: Arc<MembershipTracker>,
    mut heartbeats: mpsc::Receiver<HeartbeatMessage>,
    role: watch::Receiver<Role>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = heartbeats.recv() => {
                let Some(heartbeat) = received else {
                    debug!("heartbeat stream closed");
                    break;
                };
                if *role.borrow() != Role::Leader {
                    continue;
                }
                if let Err(e) = membership.observe_group_manager(&heartbeat, epoch_millis()) {
                    warn!(group_manager = %heartbeat.identifier, error = %e, "failed to record heartbeat");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Periodically dispatch pending submissions (leader only) and place the
/// VMs dispatched to this node.
pub async fn run_submissions(
    service: SubmissionService,
    node_id: String,
    role: watch::Receiver<Role>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval = ?interval, "submission loop started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *role.borrow() == Role::Leader {
                    if let Err(e) = service.dispatch_pending() {
                        warn!(error = %e, "dispatching failed");
                    }
                }
                match service.place(&node_id).await {
                    Ok((plan, report)) if !plan.is_empty() => {
                        info!(
                            started = report.succeeded.len(),
                            failed = report.failed.len(),
                            unplaced = plan.unplaced.len(),
                            "placement enforced"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "placement failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("submission loop stopping");
                break;
            }
        }
    }
}
