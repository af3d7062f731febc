//! redb table definitions for the farm store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types); counters are stored as plain `u64`.

use redb::TableDefinition;

/// Queue records keyed by queue name.
pub const QUEUES: TableDefinition<&str, &[u8]> = TableDefinition::new("queues");

/// Worker instances keyed by instance id.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// In-progress action count per worker, keyed by instance id.
pub const LEASES: TableDefinition<&str, u64> = TableDefinition::new("leases");

/// Actuator operations keyed by operation id.
pub const OPERATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("operations");

/// Monotonic counters keyed by name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
