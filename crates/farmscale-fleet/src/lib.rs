//! farmscale-fleet — the worker fleet as the controller sees it.
//!
//! Two contracts:
//!
//! - [`FleetInventory`] lists the workers of a queue with their lifecycle
//!   state and heartbeat.
//! - [`FleetActuator`] creates and removes workers. Calls return an
//!   operation id whose status is polled; results show up in the
//!   inventory on a later read.
//!
//! Backends:
//!
//! - [`LocalFleet`] keeps workers in a [`farmscale_state::FarmStore`];
//!   workers report heartbeats through the controller's HTTP API.
//! - [`SandboxFleet`] edits the definition of an on-demand sandbox
//!   through its CLI, one container per worker.
//!
//! `terminate` is idempotent on every backend: terminating a worker that
//! is already gone succeeds without side effects.

pub mod actuator;
pub mod error;
pub mod inventory;
pub mod local;
pub mod sandbox;

pub use actuator::FleetActuator;
pub use error::{FleetError, FleetResult};
pub use inventory::FleetInventory;
pub use local::LocalFleet;
pub use sandbox::{CsCli, ReachabilityCheck, SandboxCli, SandboxFleet, tcp_reachability};
