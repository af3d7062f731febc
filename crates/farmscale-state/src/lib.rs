//! farmscale-state — domain types and the local farm store.
//!
//! The types here (queues, worker instances, scale intents, fleet
//! snapshots) are shared by every other crate. [`FarmStore`] is a
//! [redb](https://docs.rs/redb) database holding the farm's source of
//! truth when the controller runs against a local farm: queue depths,
//! worker records, per-worker leases and actuator operations.
//!
//! # Architecture
//!
//! Values are JSON-serialized into redb's `&[u8]` columns. Worker ids are
//! unique across queues, so every table is keyed by a plain id.
//!
//! The store is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`) and
//! can be shared across async tasks. The controller itself never writes
//! scaling state here; that is what makes a restart safe.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::FarmStore;
pub use types::*;
