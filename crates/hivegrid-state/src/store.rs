//! StateStore: redb-backed [`Repository`] for HiveGrid.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). Monitoring history is trimmed to the configured retention on
//! every insert.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use hive_core::{CapacityVector, VirtualMachineStatus};

use crate::error::{StateError, StateResult};
use crate::repository::Repository;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Def = TableDefinition<'static, &'static str, &'static [u8]>;
type WriteTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Monitoring samples kept per entity unless configured otherwise.
pub const DEFAULT_RETENTION: usize = 20;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    retention: usize,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            retention: DEFAULT_RETENTION,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            retention: DEFAULT_RETENTION,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Keep at most `retention` monitoring samples per entity.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(VIRTUAL_MACHINES).map_err(map_err!(Table))?;
        txn.open_table(LOCAL_CONTROLLERS).map_err(map_err!(Table))?;
        txn.open_table(GROUP_MANAGERS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn get_one<T: DeserializeOwned>(&self, def: Def, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_all<T: DeserializeOwned>(&self, def: Def) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn put_one<T: Serialize>(&self, def: Def, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete_one(&self, def: Def, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write a single record. Returns false if it does not exist.
    fn update_one<T, F>(&self, def: Def, key: &str, f: F) -> StateResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let Some(mut record) = load::<T>(&table, key)? else {
                return Ok(false);
            };
            f(&mut record);
            store(&mut table, key, &record)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Take or renew the named lease for `holder`.
    ///
    /// Returns the lease in effect after the call: the caller holds it only
    /// if `lease.holder == holder`.
    pub fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> StateResult<Lease> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let lease;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current = load::<Lease>(&table, name)?;
            match current {
                Some(existing) if existing.holder != holder && !existing.is_expired(now_ms) => {
                    return Ok(existing);
                }
                _ => {
                    lease = Lease {
                        name: name.to_string(),
                        holder: holder.to_string(),
                        expires_at: now_ms.saturating_add(ttl_ms),
                    };
                    store(&mut table, name, &lease)?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(lease)
    }

    /// Release the named lease if `holder` owns it.
    pub fn release_lease(&self, name: &str, holder: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            released = match load::<Lease>(&table, name)? {
                Some(lease) if lease.holder == holder => {
                    table.remove(name).map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    pub fn get_lease(&self, name: &str) -> StateResult<Option<Lease>> {
        self.get_one(LEASES, name)
    }
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn load<T: DeserializeOwned>(table: &WriteTable<'_>, key: &str) -> StateResult<Option<T>> {
    let bytes = table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec());
    bytes.map(|b| decode(&b)).transpose()
}

fn store<T: Serialize>(table: &mut WriteTable<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn push_sample<T>(history: &mut History<T>, timestamp: u64, sample: T, retention: usize) {
    history.insert(timestamp, sample);
    trim_history(history, retention);
}

impl Repository for StateStore {
    // ── Local controllers ──────────────────────────────────────────

    fn get_local_controller_descriptions(
        &self,
        history_depth: usize,
    ) -> StateResult<Vec<LocalControllerDescription>> {
        let all: Vec<LocalControllerDescription> = self.list_all(LOCAL_CONTROLLERS)?;
        Ok(all
            .into_iter()
            .map(|lc| lc.with_history_depth(history_depth))
            .collect())
    }

    fn get_local_controller(
        &self,
        id: &str,
        history_depth: usize,
    ) -> StateResult<Option<LocalControllerDescription>> {
        let lc: Option<LocalControllerDescription> = self.get_one(LOCAL_CONTROLLERS, id)?;
        Ok(lc.map(|lc| lc.with_history_depth(history_depth)))
    }

    fn put_local_controller(&self, description: &LocalControllerDescription) -> StateResult<()> {
        let mut description = description.clone();
        trim_history(&mut description.monitoring, self.retention);
        self.put_one(LOCAL_CONTROLLERS, &description.id, &description)?;
        debug!(local_controller = %description.id, "local controller stored");
        Ok(())
    }

    fn drop_local_controller(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete_one(LOCAL_CONTROLLERS, id)?;
        debug!(local_controller = %id, existed, "local controller dropped");
        Ok(existed)
    }

    fn add_local_controller_monitoring(
        &self,
        id: &str,
        timestamp: u64,
        used_capacity: CapacityVector,
    ) -> StateResult<bool> {
        let retention = self.retention;
        let updated = self.update_one(
            LOCAL_CONTROLLERS,
            id,
            |lc: &mut LocalControllerDescription| {
                push_sample(&mut lc.monitoring, timestamp, used_capacity, retention);
                lc.last_heartbeat = lc.last_heartbeat.max(timestamp);
            },
        )?;
        if !updated {
            warn!(local_controller = %id, "monitoring for unknown local controller dropped");
        }
        Ok(updated)
    }

    fn refresh_local_controller(&self, id: &str, timestamp: u64) -> StateResult<bool> {
        self.update_one(LOCAL_CONTROLLERS, id, |lc: &mut LocalControllerDescription| {
            lc.last_heartbeat = lc.last_heartbeat.max(timestamp);
        })
    }

    fn get_host_monitoring_values(
        &self,
        local_controller_id: &str,
        history_depth: usize,
    ) -> StateResult<Vec<HostMonitoringEntry>> {
        let lc: Option<LocalControllerDescription> =
            self.get_one(LOCAL_CONTROLLERS, local_controller_id)?;
        let Some(lc) = lc else {
            return Ok(Vec::new());
        };
        let skip = lc.monitoring.len().saturating_sub(history_depth);
        Ok(lc
            .monitoring
            .into_iter()
            .skip(skip)
            .map(|(timestamp, used_capacity)| HostMonitoringEntry {
                timestamp,
                used_capacity,
            })
            .collect())
    }

    // ── Group managers ─────────────────────────────────────────────

    fn get_group_manager_descriptions(
        &self,
        history_depth: usize,
    ) -> StateResult<Vec<GroupManagerDescription>> {
        let all: Vec<GroupManagerDescription> = self.list_all(GROUP_MANAGERS)?;
        Ok(all
            .into_iter()
            .map(|gm| gm.with_history_depth(history_depth))
            .collect())
    }

    fn add_group_manager_description(
        &self,
        description: &GroupManagerDescription,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUP_MANAGERS).map_err(map_err!(Table))?;
            let mut merged = description.clone();
            if let Some(existing) = load::<GroupManagerDescription>(&table, &description.id)? {
                let mut summaries = existing.summaries;
                summaries.extend(merged.summaries);
                merged.summaries = summaries;
                merged.last_seen = merged.last_seen.max(existing.last_seen);
            }
            trim_history(&mut merged.summaries, self.retention);
            store(&mut table, &merged.id, &merged)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group_manager = %description.id, "group manager stored");
        Ok(())
    }

    fn add_group_manager_summary(
        &self,
        id: &str,
        timestamp: u64,
        summary: GroupManagerSummary,
    ) -> StateResult<bool> {
        let retention = self.retention;
        self.update_one(GROUP_MANAGERS, id, |gm: &mut GroupManagerDescription| {
            push_sample(&mut gm.summaries, timestamp, summary, retention);
            gm.last_seen = gm.last_seen.max(timestamp);
        })
    }

    fn drop_group_manager(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete_one(GROUP_MANAGERS, id)?;
        debug!(group_manager = %id, existed, "group manager dropped");
        Ok(existed)
    }

    // ── Virtual machines ───────────────────────────────────────────

    fn get_virtual_machines(&self, history_depth: usize) -> StateResult<Vec<VirtualMachineMetaData>> {
        let all: Vec<VirtualMachineMetaData> = self.list_all(VIRTUAL_MACHINES)?;
        Ok(all
            .into_iter()
            .map(|vm| vm.with_history_depth(history_depth))
            .collect())
    }

    fn get_virtual_machine(
        &self,
        id: &str,
        history_depth: usize,
    ) -> StateResult<Option<VirtualMachineMetaData>> {
        let vm: Option<VirtualMachineMetaData> = self.get_one(VIRTUAL_MACHINES, id)?;
        Ok(vm.map(|vm| vm.with_history_depth(history_depth)))
    }

    fn get_virtual_machines_on(
        &self,
        local_controller_id: &str,
        history_depth: usize,
    ) -> StateResult<Vec<VirtualMachineMetaData>> {
        let Some(lc) = self.get_local_controller(local_controller_id, 0)? else {
            return Ok(Vec::new());
        };
        let mut vms = Vec::with_capacity(lc.virtual_machines.len());
        for vm_id in &lc.virtual_machines {
            match self.get_virtual_machine(vm_id, history_depth)? {
                Some(vm) => vms.push(vm),
                None => {
                    warn!(local_controller = %local_controller_id, vm = %vm_id, "hosted vm has no metadata")
                }
            }
        }
        Ok(vms)
    }

    fn put_virtual_machine(&self, vm: &VirtualMachineMetaData) -> StateResult<()> {
        let mut vm = vm.clone();
        trim_history(&mut vm.monitoring, self.retention);
        self.put_one(VIRTUAL_MACHINES, &vm.id, &vm)?;
        debug!(vm = %vm.id, status = %vm.status, "virtual machine stored");
        Ok(())
    }

    fn register_virtual_machine(&self, vm: &VirtualMachineMetaData) -> StateResult<CommitOutcome> {
        let Some(host) = vm.local_controller_id() else {
            self.put_virtual_machine(vm)?;
            return Ok(CommitOutcome::Committed);
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut vms = txn.open_table(VIRTUAL_MACHINES).map_err(map_err!(Table))?;
            let mut lcs = txn.open_table(LOCAL_CONTROLLERS).map_err(map_err!(Table))?;

            let Some(mut target) = load::<LocalControllerDescription>(&lcs, host)? else {
                return Ok(CommitOutcome::stale(format!("local controller {host} not found")));
            };
            if let Some(previous) = load::<VirtualMachineMetaData>(&vms, &vm.id)?
                && let Some(old_host) = previous.local_controller_id()
                && old_host != host
                && let Some(mut old) = load::<LocalControllerDescription>(&lcs, old_host)?
            {
                old.virtual_machines.remove(&vm.id);
                store(&mut lcs, old_host, &old)?;
            }

            let mut vm = vm.clone();
            vm.location.local_controller_address = Some(target.control_address.clone());
            if vm.location.group_manager_id.is_none() {
                vm.location.group_manager_id = target.group_manager_id.clone();
            }
            trim_history(&mut vm.monitoring, self.retention);
            target.virtual_machines.insert(vm.id.clone());

            store(&mut lcs, host, &target)?;
            store(&mut vms, &vm.id, &vm)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm = %vm.id, local_controller = %host, "virtual machine registered");
        Ok(CommitOutcome::Committed)
    }

    fn add_virtual_machine_monitoring(
        &self,
        id: &str,
        timestamp: u64,
        used_capacity: CapacityVector,
    ) -> StateResult<bool> {
        let retention = self.retention;
        self.update_one(VIRTUAL_MACHINES, id, |vm: &mut VirtualMachineMetaData| {
            push_sample(&mut vm.monitoring, timestamp, used_capacity, retention);
        })
    }

    fn assign_virtual_machine(
        &self,
        vm_id: &str,
        local_controller_id: &str,
    ) -> StateResult<CommitOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut vms = txn.open_table(VIRTUAL_MACHINES).map_err(map_err!(Table))?;
            let mut lcs = txn.open_table(LOCAL_CONTROLLERS).map_err(map_err!(Table))?;

            let Some(mut vm) = load::<VirtualMachineMetaData>(&vms, vm_id)? else {
                return Ok(CommitOutcome::stale(format!("vm {vm_id} not found")));
            };
            if vm.status.is_terminal() {
                return Ok(CommitOutcome::stale(format!(
                    "vm {vm_id} is {}",
                    vm.status
                )));
            }
            let Some(mut target) = load::<LocalControllerDescription>(&lcs, local_controller_id)?
            else {
                return Ok(CommitOutcome::stale(format!(
                    "local controller {local_controller_id} not found"
                )));
            };

            if let Some(previous) = vm.location.local_controller_id.clone()
                && previous != local_controller_id
                && let Some(mut old) = load::<LocalControllerDescription>(&lcs, &previous)?
            {
                old.virtual_machines.remove(vm_id);
                store(&mut lcs, &previous, &old)?;
            }

            target.virtual_machines.insert(vm_id.to_string());
            vm.location.local_controller_id = Some(target.id.clone());
            vm.location.local_controller_address = Some(target.control_address.clone());
            if target.group_manager_id.is_some() {
                vm.location.group_manager_id = target.group_manager_id.clone();
            }
            vm.status = VirtualMachineStatus::Running;
            vm.error_code = None;

            store(&mut lcs, local_controller_id, &target)?;
            store(&mut vms, vm_id, &vm)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm = %vm_id, local_controller = %local_controller_id, "virtual machine assigned");
        Ok(CommitOutcome::Committed)
    }

    fn commit_migration(
        &self,
        vm_id: &str,
        source: &str,
        destination: &str,
    ) -> StateResult<CommitOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut vms = txn.open_table(VIRTUAL_MACHINES).map_err(map_err!(Table))?;
            let mut lcs = txn.open_table(LOCAL_CONTROLLERS).map_err(map_err!(Table))?;

            let Some(mut vm) = load::<VirtualMachineMetaData>(&vms, vm_id)? else {
                return Ok(CommitOutcome::stale(format!("vm {vm_id} not found")));
            };
            if vm.status.is_terminal() {
                return Ok(CommitOutcome::stale(format!(
                    "vm {vm_id} is {}",
                    vm.status
                )));
            }
            if vm.local_controller_id() != Some(source) {
                return Ok(CommitOutcome::stale(format!(
                    "vm {vm_id} is no longer on {source}"
                )));
            }
            let Some(mut target) = load::<LocalControllerDescription>(&lcs, destination)? else {
                return Ok(CommitOutcome::stale(format!(
                    "local controller {destination} not found"
                )));
            };

            if let Some(mut origin) = load::<LocalControllerDescription>(&lcs, source)? {
                origin.virtual_machines.remove(vm_id);
                store(&mut lcs, source, &origin)?;
            }
            target.virtual_machines.insert(vm_id.to_string());
            vm.location.local_controller_id = Some(target.id.clone());
            vm.location.local_controller_address = Some(target.control_address.clone());
            if target.group_manager_id.is_some() {
                vm.location.group_manager_id = target.group_manager_id.clone();
            }
            vm.status = VirtualMachineStatus::Running;

            store(&mut lcs, destination, &target)?;
            store(&mut vms, vm_id, &vm)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm = %vm_id, %source, %destination, "migration committed");
        Ok(CommitOutcome::Committed)
    }

    fn update_virtual_machine_status(
        &self,
        vm_id: &str,
        status: VirtualMachineStatus,
        error_code: Option<String>,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut vms = txn.open_table(VIRTUAL_MACHINES).map_err(map_err!(Table))?;
            let mut lcs = txn.open_table(LOCAL_CONTROLLERS).map_err(map_err!(Table))?;

            let Some(mut vm) = load::<VirtualMachineMetaData>(&vms, vm_id)? else {
                return Ok(false);
            };
            vm.status = status;
            vm.error_code = match status {
                VirtualMachineStatus::Error => error_code,
                _ => None,
            };
            if status.is_terminal()
                && let Some(host) = vm.location.local_controller_id.take()
            {
                vm.location.local_controller_address = None;
                if let Some(mut lc) = load::<LocalControllerDescription>(&lcs, &host)? {
                    lc.virtual_machines.remove(vm_id);
                    store(&mut lcs, &host, &lc)?;
                }
            }
            store(&mut vms, vm_id, &vm)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm = %vm_id, %status, "virtual machine status updated");
        Ok(true)
    }

    fn remove_virtual_machine(&self, vm_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut vms = txn.open_table(VIRTUAL_MACHINES).map_err(map_err!(Table))?;
            let mut lcs = txn.open_table(LOCAL_CONTROLLERS).map_err(map_err!(Table))?;

            let Some(vm) = load::<VirtualMachineMetaData>(&vms, vm_id)? else {
                return Ok(false);
            };
            if let Some(host) = vm.local_controller_id()
                && let Some(mut lc) = load::<LocalControllerDescription>(&lcs, host)?
            {
                lc.virtual_machines.remove(vm_id);
                store(&mut lcs, host, &lc)?;
            }
            vms.remove(vm_id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm = %vm_id, "virtual machine removed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(values: &[f64]) -> CapacityVector {
        CapacityVector::from_slice(values)
    }

    fn store_with_hosts() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["lc-1", "lc-2"] {
            let mut lc =
                LocalControllerDescription::new(id, &format!("{id}:5000"), cap(&[8.0, 16.0]));
            lc.group_manager_id = Some("gm-1".to_string());
            store.put_local_controller(&lc).unwrap();
        }
        store
    }

    fn add_vm(store: &StateStore, id: &str) {
        store
            .put_virtual_machine(&VirtualMachineMetaData::new(id, cap(&[1.0, 2.0])))
            .unwrap();
    }

    #[test]
    fn local_controller_crud() {
        let store = store_with_hosts();
        let lc = store.get_local_controller("lc-1", 10).unwrap().unwrap();
        assert_eq!(lc.control_address, "lc-1:5000");
        assert_eq!(store.get_local_controller_descriptions(10).unwrap().len(), 2);

        assert!(store.drop_local_controller("lc-1").unwrap());
        assert!(!store.drop_local_controller("lc-1").unwrap());
        assert!(store.get_local_controller("lc-1", 10).unwrap().is_none());
    }

    #[test]
    fn monitoring_is_bounded_by_retention() {
        let store = store_with_hosts().with_retention(3);
        for ts in 1..=5u64 {
            assert!(
                store
                    .add_local_controller_monitoring("lc-1", ts, cap(&[ts as f64, 0.0]))
                    .unwrap()
            );
        }
        let values = store.get_host_monitoring_values("lc-1", 10).unwrap();
        let stamps: Vec<u64> = values.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![3, 4, 5]);

        let last_two = store.get_host_monitoring_values("lc-1", 2).unwrap();
        assert_eq!(last_two[0].timestamp, 4);
        assert_eq!(store.get_local_controller("lc-1", 1).unwrap().unwrap().monitoring.len(), 1);
    }

    #[test]
    fn monitoring_for_unknown_entities_is_rejected() {
        let store = store_with_hosts();
        assert!(!store.add_local_controller_monitoring("ghost", 1, cap(&[1.0])).unwrap());
        assert!(!store.add_virtual_machine_monitoring("ghost", 1, cap(&[1.0])).unwrap());
        assert!(store.get_host_monitoring_values("ghost", 5).unwrap().is_empty());
    }

    #[test]
    fn assign_binds_vm_to_host() {
        let store = store_with_hosts();
        add_vm(&store, "vm-1");

        let outcome = store.assign_virtual_machine("vm-1", "lc-1").unwrap();
        assert!(outcome.is_committed());

        let vm = store.get_virtual_machine("vm-1", 0).unwrap().unwrap();
        assert_eq!(vm.status, VirtualMachineStatus::Running);
        assert_eq!(vm.local_controller_id(), Some("lc-1"));
        assert_eq!(vm.location.group_manager_id.as_deref(), Some("gm-1"));
        assert_eq!(store.get_virtual_machines_on("lc-1", 0).unwrap().len(), 1);
    }

    #[test]
    fn register_joins_host_set_without_starting() {
        let store = store_with_hosts();
        let mut pinned = VirtualMachineMetaData::new("pinned", cap(&[1.0, 2.0]));
        pinned.location.local_controller_id = Some("lc-2".to_string());

        assert!(store.register_virtual_machine(&pinned).unwrap().is_committed());
        let vm = store.get_virtual_machine("pinned", 0).unwrap().unwrap();
        assert_eq!(vm.status, VirtualMachineStatus::Init);
        assert_eq!(vm.location.group_manager_id.as_deref(), Some("gm-1"));
        assert_eq!(vm.location.local_controller_address.as_deref(), Some("lc-2:5000"));
        assert!(store.get_local_controller("lc-2", 0).unwrap().unwrap().hosts("pinned"));

        pinned.location.local_controller_id = Some("lc-9".to_string());
        let outcome = store.register_virtual_machine(&pinned).unwrap();
        assert!(matches!(outcome, CommitOutcome::Stale { .. }));
        let vm = store.get_virtual_machine("pinned", 0).unwrap().unwrap();
        assert_eq!(vm.local_controller_id(), Some("lc-2"));
    }

    #[test]
    fn refresh_only_moves_liveness_forward() {
        let store = store_with_hosts();
        assert!(store.refresh_local_controller("lc-1", 5_000).unwrap());
        assert!(store.refresh_local_controller("lc-1", 2_000).unwrap());
        assert!(!store.refresh_local_controller("lc-9", 5_000).unwrap());

        let lc = store.get_local_controller("lc-1", 10).unwrap().unwrap();
        assert_eq!(lc.last_heartbeat, 5_000);
        assert!(lc.monitoring.is_empty());
    }

    #[test]
    fn commit_migration_moves_ownership() {
        let store = store_with_hosts();
        add_vm(&store, "vm-1");
        store.assign_virtual_machine("vm-1", "lc-1").unwrap();

        let outcome = store.commit_migration("vm-1", "lc-1", "lc-2").unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        let lc1 = store.get_local_controller("lc-1", 0).unwrap().unwrap();
        let lc2 = store.get_local_controller("lc-2", 0).unwrap().unwrap();
        assert!(!lc1.hosts("vm-1"));
        assert!(lc2.hosts("vm-1"));
        let vm = store.get_virtual_machine("vm-1", 0).unwrap().unwrap();
        assert_eq!(vm.location.local_controller_address.as_deref(), Some("lc-2:5000"));
    }

    #[test]
    fn commit_migration_detects_stale_source() {
        let store = store_with_hosts();
        add_vm(&store, "vm-1");
        store.assign_virtual_machine("vm-1", "lc-2").unwrap();

        let outcome = store.commit_migration("vm-1", "lc-1", "lc-2").unwrap();
        assert!(matches!(outcome, CommitOutcome::Stale { .. }));

        let missing = store.commit_migration("vm-404", "lc-1", "lc-2").unwrap();
        assert!(!missing.is_committed());

        let no_dest = store.commit_migration("vm-1", "lc-2", "lc-9").unwrap();
        assert!(!no_dest.is_committed());
        assert!(store.get_local_controller("lc-2", 0).unwrap().unwrap().hosts("vm-1"));
    }

    #[test]
    fn terminal_status_detaches_vm() {
        let store = store_with_hosts();
        add_vm(&store, "vm-1");
        store.assign_virtual_machine("vm-1", "lc-1").unwrap();

        assert!(
            store
                .update_virtual_machine_status("vm-1", VirtualMachineStatus::Destroyed, None)
                .unwrap()
        );
        let vm = store.get_virtual_machine("vm-1", 0).unwrap().unwrap();
        assert!(vm.local_controller_id().is_none());
        assert!(!store.get_local_controller("lc-1", 0).unwrap().unwrap().hosts("vm-1"));

        let outcome = store.assign_virtual_machine("vm-1", "lc-2").unwrap();
        assert!(!outcome.is_committed());
    }

    #[test]
    fn error_code_only_kept_for_error_status() {
        let store = store_with_hosts();
        add_vm(&store, "vm-1");
        store
            .update_virtual_machine_status(
                "vm-1",
                VirtualMachineStatus::Error,
                Some("boot failed".to_string()),
            )
            .unwrap();
        let vm = store.get_virtual_machine("vm-1", 0).unwrap().unwrap();
        assert_eq!(vm.error_code.as_deref(), Some("boot failed"));

        store
            .update_virtual_machine_status(
                "vm-1",
                VirtualMachineStatus::Running,
                Some("ignored".to_string()),
            )
            .unwrap();
        let vm = store.get_virtual_machine("vm-1", 0).unwrap().unwrap();
        assert!(vm.error_code.is_none());
    }

    #[test]
    fn remove_vm_clears_host_set() {
        let store = store_with_hosts();
        add_vm(&store, "vm-1");
        store.assign_virtual_machine("vm-1", "lc-1").unwrap();

        assert!(store.remove_virtual_machine("vm-1").unwrap());
        assert!(!store.remove_virtual_machine("vm-1").unwrap());
        assert!(store.get_virtual_machines_on("lc-1", 0).unwrap().is_empty());
    }

    #[test]
    fn group_manager_summaries_survive_reregistration() {
        let store = StateStore::open_in_memory().unwrap();
        let gm = GroupManagerDescription::new("gm-1", Default::default(), "127.0.0.1:9000");
        store.add_group_manager_description(&gm).unwrap();
        store
            .add_group_manager_summary("gm-1", 100, GroupManagerSummary::default())
            .unwrap();
        store.add_group_manager_description(&gm).unwrap();

        let all = store.get_group_manager_descriptions(5).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].summaries.len(), 1);
        assert_eq!(all[0].last_seen, 100);

        assert!(store.drop_group_manager("gm-1").unwrap());
        assert!(
            !store
                .add_group_manager_summary("gm-1", 200, GroupManagerSummary::default())
                .unwrap()
        );
    }

    #[test]
    fn leases_expire_and_release() {
        let store = StateStore::open_in_memory().unwrap();

        let lease = store.acquire_lease("leader", "a", 1000, 0).unwrap();
        assert_eq!(lease.holder, "a");

        // b cannot take a live lease
        let lease = store.acquire_lease("leader", "b", 1000, 500).unwrap();
        assert_eq!(lease.holder, "a");

        // a renews
        let lease = store.acquire_lease("leader", "a", 1000, 900).unwrap();
        assert_eq!(lease.expires_at, 1900);

        // expired: b takes over
        let lease = store.acquire_lease("leader", "b", 1000, 2000).unwrap();
        assert_eq!(lease.holder, "b");

        assert!(!store.release_lease("leader", "a").unwrap());
        assert!(store.release_lease("leader", "b").unwrap());
        assert!(store.get_lease("leader").unwrap().is_none());
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.redb");
        {
            let store = StateStore::open(&path).unwrap();
            add_vm(&store, "vm-1");
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_virtual_machine("vm-1", 0).unwrap().is_some());
    }
}
