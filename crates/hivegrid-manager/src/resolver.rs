//! Anomaly resolver: turns anomaly events into relocation plans and
//! enforces them.
//!
//! At most one resolution runs per local controller. Events for a
//! controller that is already being resolved are dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hive_core::{Event, EventKind, Notifier};
use hivegrid_migration::{EnforcementReport, PlanEnforcer};
use hivegrid_placement::{RelocationKind, RelocationPolicy};
use hivegrid_state::Repository;

use crate::anomaly::AnomalyEvent;
use crate::error::{ManagerError, ManagerResult};

pub struct AnomalyResolver {
    repository: Arc<dyn Repository>,
    relocation: RelocationPolicy,
    enforcer: Arc<PlanEnforcer>,
    notifier: Notifier,
    node_id: String,
    history_depth: usize,
    resolving: Mutex<HashSet<String>>,
}

impl AnomalyResolver {
    pub fn new(
        relocation: RelocationPolicy,
        enforcer: Arc<PlanEnforcer>,
        notifier: Notifier,
        node_id: &str,
        history_depth: usize,
    ) -> Self {
        Self {
            repository: Arc::clone(enforcer.repository()),
            relocation,
            enforcer,
            notifier,
            node_id: node_id.to_string(),
            history_depth,
            resolving: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_resolving(&self, local_controller_id: &str) -> bool {
        self.resolving
            .lock()
            .map(|set| set.contains(local_controller_id))
            .unwrap_or(false)
    }

    /// Resolve one event. Returns `None` when there was nothing to do.
    pub async fn resolve(&self, event: &AnomalyEvent) -> ManagerResult<Option<EnforcementReport>> {
        if !self.claim(&event.local_controller_id) {
            debug!(local_controller = %event.local_controller_id, "already resolving");
            return Ok(None);
        }
        let result = self.resolve_claimed(event).await;
        self.release(&event.local_controller_id);
        result
    }

    /// Consume events until the channel closes or shutdown. In-flight
    /// resolutions are awaited before returning.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<AnomalyEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                received = events.recv() => {
                    let Some(event) = received else { break };
                    if !self.claim(&event.local_controller_id) {
                        debug!(local_controller = %event.local_controller_id, "duplicate anomaly suppressed");
                        continue;
                    }
                    let resolver = Arc::clone(&self);
                    tasks.spawn(async move {
                        if let Err(e) = resolver.resolve_claimed(&event).await {
                            warn!(local_controller = %event.local_controller_id, error = %e, "anomaly resolution failed");
                        }
                        resolver.release(&event.local_controller_id);
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }
        while tasks.join_next().await.is_some() {}
        debug!("anomaly resolver stopped");
    }

    fn claim(&self, local_controller_id: &str) -> bool {
        self.resolving
            .lock()
            .map(|mut set| set.insert(local_controller_id.to_string()))
            .unwrap_or(false)
    }

    fn release(&self, local_controller_id: &str) {
        if let Ok(mut set) = self.resolving.lock() {
            set.remove(local_controller_id);
        }
    }

    async fn resolve_claimed(&self, event: &AnomalyEvent) -> ManagerResult<Option<EnforcementReport>> {
        let Some(kind) = RelocationKind::for_state(event.state) else {
            return Ok(None);
        };
        if !self.relocation.is_enabled(kind) {
            debug!(?kind, local_controller = %event.local_controller_id, "relocation disabled");
            return Ok(None);
        }

        let depth = self.history_depth;
        let source = self
            .repository
            .get_local_controller(&event.local_controller_id, depth)?
            .ok_or_else(|| ManagerError::LocalControllerNotFound(event.local_controller_id.clone()))?;
        let candidates = self
            .repository
            .get_local_controller_descriptions(depth)?
            .into_iter()
            .filter(|lc| lc.id != source.id)
            .collect();
        let vms = self.repository.get_virtual_machines_on(&source.id, depth)?;

        let plan = self
            .relocation
            .relocate_virtual_machines(kind, &source, candidates, vms);
        if plan.is_empty() {
            info!(?kind, local_controller = %source.id, "no relocation possible");
            return Ok(None);
        }

        info!(
            ?kind,
            local_controller = %source.id,
            migrations = plan.number_of_migrations(),
            "relocating"
        );
        self.notifier
            .notify(Event::new(EventKind::Reconfiguration, &self.node_id, &plan));
        let report = self.enforcer.enforce(&plan).await;
        Ok(Some(report))
    }
}
