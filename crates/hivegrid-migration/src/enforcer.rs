//! Plan enforcer: apply a plan against the live cluster.
//!
//! Each directive is re-checked against the repository before it runs,
//! because the cluster may have changed since the plan was computed. Stale
//! directives are skipped. The rest run concurrently, one task each; the
//! enforcer waits for all of them, commits every success atomically and
//! restores the prior status of every failure. A VM that moved but whose
//! commit turned stale is flagged `Error`. One failed VM never affects its
//! siblings.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hive_core::{EventKind, HypervisorSettings, Notifier, VirtualMachineStatus, Event};
use hivegrid_placement::{PlacementPlan, ReconfigurationPlan, RelocationDirective};
use hivegrid_state::{CommitOutcome, Repository, VirtualMachineLocation};

use crate::error::MigrationResult;
use crate::lifecycle::VirtualMachineCommand;
use crate::request::MigrationRequest;
use crate::worker::MigrationWorker;

/// Error code of a VM that left its source host without its new location
/// being recorded.
pub const MIGRATION_NOT_COMMITTED: &str = "MIGRATION_NOT_COMMITTED";

/// Payload of a `Migrated` event.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome<'a> {
    pub request: &'a MigrationRequest,
    pub committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
}

impl<'a> MigrationOutcome<'a> {
    fn committed(request: &'a MigrationRequest) -> Self {
        Self {
            request,
            committed: true,
            reason: None,
        }
    }

    fn stale(request: &'a MigrationRequest, reason: &'a str) -> Self {
        Self {
            request,
            committed: false,
            reason: Some(reason),
        }
    }
}

/// Per-VM outcome of enforcing a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnforcementReport {
    pub succeeded: Vec<String>,
    /// VM id and failure reason.
    pub failed: Vec<(String, String)>,
    /// VM id and why the directive no longer applied.
    pub skipped: Vec<(String, String)>,
}

impl EnforcementReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    fn skip(&mut self, vm_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!(vm = %vm_id, %reason, "directive skipped");
        self.skipped.push((vm_id.to_string(), reason));
    }

    fn fail(&mut self, vm_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(vm = %vm_id, %reason, "directive failed");
        self.failed.push((vm_id.to_string(), reason));
    }
}

pub struct PlanEnforcer {
    repository: Arc<dyn Repository>,
    worker: Arc<MigrationWorker>,
    notifier: Notifier,
    hypervisor: HypervisorSettings,
    /// Id reported as the source of emitted events.
    node_id: String,
}

impl PlanEnforcer {
    pub fn new(
        repository: Arc<dyn Repository>,
        worker: Arc<MigrationWorker>,
        notifier: Notifier,
        node_id: &str,
    ) -> Self {
        Self {
            repository,
            worker,
            notifier,
            hypervisor: HypervisorSettings::default(),
            node_id: node_id.to_string(),
        }
    }

    pub fn with_hypervisor(mut self, hypervisor: HypervisorSettings) -> Self {
        self.hypervisor = hypervisor;
        self
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn worker(&self) -> &Arc<MigrationWorker> {
        &self.worker
    }

    /// Run every directive of `plan` and wait for all of them. Repository
    /// errors are recorded against the VM they hit; every spawned migration
    /// is still awaited and settled.
    pub async fn enforce(&self, plan: &ReconfigurationPlan) -> EnforcementReport {
        let mut report = EnforcementReport::default();
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, (String, VirtualMachineStatus)> = HashMap::new();

        for directive in &plan.directives {
            let vm_id = directive.virtual_machine_id.as_str();
            let (request, prior) = match self.prepare(directive, &mut report) {
                Ok(Some(prepared)) => prepared,
                Ok(None) => continue,
                Err(e) => {
                    report.fail(vm_id, format!("could not prepare migration: {e}"));
                    continue;
                }
            };
            self.notifier.notify(Event::new(
                EventKind::Migrate,
                &self.node_id,
                directive,
            ));
            let worker = Arc::clone(&self.worker);
            let handle = tasks.spawn(async move { worker.run(request).await });
            in_flight.insert(handle.id(), (vm_id.to_string(), prior));
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, request)) => {
                    let prior = in_flight
                        .remove(&id)
                        .map(|(_, prior)| prior)
                        .unwrap_or(VirtualMachineStatus::Running);
                    let vm_id = request.virtual_machine_id.clone();
                    if let Err(e) = self.finish(request, prior, &mut report) {
                        self.restore(&vm_id, prior);
                        report.fail(&vm_id, format!("could not settle migration: {e}"));
                    }
                }
                Err(e) => {
                    if let Some((vm_id, prior)) = in_flight.remove(&e.id()) {
                        self.restore(&vm_id, prior);
                        report.fail(&vm_id, format!("migration task failed: {e}"));
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "plan enforced"
        );
        report
    }

    /// Best-effort status reset after a failure that already hit the store.
    fn restore(&self, vm_id: &str, prior: VirtualMachineStatus) {
        if let Err(e) = self.repository.update_virtual_machine_status(vm_id, prior, None) {
            warn!(vm = %vm_id, status = %prior, error = %e, "could not restore vm status");
        }
    }

    /// Validate a directive against current state and mark the VM migrating.
    fn prepare(
        &self,
        directive: &RelocationDirective,
        report: &mut EnforcementReport,
    ) -> MigrationResult<Option<(MigrationRequest, VirtualMachineStatus)>> {
        let vm_id = directive.virtual_machine_id.as_str();
        let Some(vm) = self.repository.get_virtual_machine(vm_id, 0)? else {
            report.skip(vm_id, "vm no longer exists");
            return Ok(None);
        };
        if vm.local_controller_id() != Some(directive.source.as_str()) {
            report.skip(vm_id, format!("vm is no longer on {}", directive.source));
            return Ok(None);
        }
        let command = VirtualMachineCommand::Migrate {
            destination: directive.destination.clone(),
        };
        let migrating = match command.begin(vm.status) {
            Ok(status) => status,
            Err(e) => {
                report.skip(vm_id, e.to_string());
                return Ok(None);
            }
        };
        let Some(destination) = self
            .repository
            .get_local_controller(&directive.destination, 0)?
        else {
            report.skip(vm_id, format!("destination {} is gone", directive.destination));
            return Ok(None);
        };

        self.repository
            .update_virtual_machine_status(vm_id, migrating, None)?;

        let group_manager = destination
            .group_manager_id
            .clone()
            .or_else(|| vm.location.group_manager_id.clone());
        let target = VirtualMachineLocation {
            group_manager_id: group_manager,
            local_controller_id: Some(destination.id.clone()),
            local_controller_address: Some(destination.control_address.clone()),
        };
        debug!(vm = %vm_id, source = %directive.source, destination = %directive.destination, "migration dispatched");
        Ok(Some((
            MigrationRequest::new(vm_id, vm.location.clone(), target, self.hypervisor.clone()),
            vm.status,
        )))
    }

    fn finish(
        &self,
        request: MigrationRequest,
        prior: VirtualMachineStatus,
        report: &mut EnforcementReport,
    ) -> MigrationResult<()> {
        let vm_id = request.virtual_machine_id.as_str();
        let (Some(source), Some(destination)) = (
            request.source_local_controller(),
            request.destination_local_controller(),
        ) else {
            self.repository.update_virtual_machine_status(vm_id, prior, None)?;
            report.fail(vm_id, "request without source or destination");
            return Ok(());
        };

        if !request.migrated {
            self.repository.update_virtual_machine_status(vm_id, prior, None)?;
            report.fail(vm_id, "actuator did not complete the migration");
            return Ok(());
        }

        match self.repository.commit_migration(vm_id, source, destination)? {
            CommitOutcome::Committed => {
                info!(vm = %vm_id, %source, %destination, "migration committed");
                self.notifier.notify(Event::new(
                    EventKind::Migrated,
                    &self.node_id,
                    MigrationOutcome::committed(&request),
                ));
                report.succeeded.push(vm_id.to_string());
            }
            CommitOutcome::Stale { reason } => {
                // The VM left the source host but its new home cannot be
                // recorded. It is detached and flagged so no plan relies on
                // the stale location.
                let flagged = match self.repository.get_virtual_machine(vm_id, 0)? {
                    Some(vm) if !vm.status.is_terminal() => {
                        self.repository.update_virtual_machine_status(
                            vm_id,
                            VirtualMachineStatus::Error,
                            Some(MIGRATION_NOT_COMMITTED.to_string()),
                        )?;
                        true
                    }
                    _ => false,
                };
                self.notifier.notify(Event::new(
                    EventKind::Migrated,
                    &self.node_id,
                    MigrationOutcome::stale(&request, &reason),
                ));
                report.fail(
                    vm_id,
                    format!("migrated but not committed: {reason} (flagged: {flagged})"),
                );
            }
        }
        Ok(())
    }

    /// Start every assigned VM on its local controller and bind it there.
    /// Like [`PlanEnforcer::enforce`], repository errors fail only the VM
    /// they hit.
    pub async fn enforce_placement(&self, plan: &PlacementPlan) -> EnforcementReport {
        let mut report = EnforcementReport::default();
        let mut tasks = JoinSet::new();

        for (vm_id, lc_id) in &plan.assignments {
            let (vm, lc) = match (
                self.repository.get_virtual_machine(vm_id, 0),
                self.repository.get_local_controller(lc_id, 0),
            ) {
                (Ok(Some(vm)), Ok(Some(lc))) => (vm, lc),
                (Ok(None), _) => {
                    report.skip(vm_id, "vm no longer exists");
                    continue;
                }
                (_, Ok(None)) => {
                    report.skip(vm_id, format!("local controller {lc_id} is gone"));
                    continue;
                }
                (Err(e), _) | (_, Err(e)) => {
                    report.fail(vm_id, format!("could not prepare start: {e}"));
                    continue;
                }
            };
            if let Err(e) = VirtualMachineCommand::Start.begin(vm.status) {
                report.skip(vm_id, e.to_string());
                continue;
            }
            self.notifier
                .notify(Event::new(EventKind::Start, &self.node_id, &vm));
            let actuator = Arc::clone(self.worker.actuator());
            tasks.spawn(async move {
                let outcome = actuator.start(&lc.control_address, &vm).await;
                (vm.id, lc.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (vm_id, lc_id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "placement task failed");
                    continue;
                }
            };
            match outcome {
                Ok(()) => match self.repository.assign_virtual_machine(&vm_id, &lc_id) {
                    Ok(CommitOutcome::Committed) => {
                        info!(vm = %vm_id, local_controller = %lc_id, "vm started");
                        report.succeeded.push(vm_id);
                    }
                    Ok(CommitOutcome::Stale { reason }) => report.fail(&vm_id, reason),
                    Err(e) => report.fail(&vm_id, format!("started but not bound: {e}")),
                },
                Err(e) => {
                    if let Err(store_error) = self.repository.update_virtual_machine_status(
                        &vm_id,
                        VirtualMachineStatus::Error,
                        Some(e.to_string()),
                    ) {
                        warn!(vm = %vm_id, error = %store_error, "could not record start failure");
                    }
                    report.fail(&vm_id, e.to_string());
                }
            }
        }
        report
    }
}
