//! redb table definitions for the HiveGrid state store.
//!
//! Each table uses `&str` keys (entity ids) and `&[u8]` values
//! (JSON-serialized domain types).

use redb::TableDefinition;

/// Virtual machine metadata keyed by `{vm_id}`.
pub const VIRTUAL_MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("virtual_machines");

/// Local controller descriptions keyed by `{local_controller_id}`.
pub const LOCAL_CONTROLLERS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("local_controllers");

/// Group manager descriptions keyed by `{group_manager_id}`.
pub const GROUP_MANAGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_managers");

/// Coordination leases keyed by `{lease_name}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
