//! farmscale-backplane — reads queue pressure from the farm's backplane.
//!
//! A [`BackplaneProbe`] answers two questions: how deep is a queue
//! (pending + in-progress actions) and how many actions does one worker
//! still hold. [`CachedProbe`] wraps any probe with a last-known-good
//! cache so transient read failures degrade to a stale sample instead of
//! an error.
//!
//! # Architecture
//!
//! ```text
//! CachedProbe
//!   ├── last good QueueSample per queue
//!   ├── consecutive failure count per queue
//!   └── inner: Arc<dyn BackplaneProbe>
//!         ├── StoreBackplane   (local farm store)
//!         └── MetricsBackplane (Prometheus scrape over HTTP)
//! ```
//!
//! A cached sample older than the staleness threshold is stale. The
//! reconciler never scales up on a stale sample.

pub mod cache;
pub mod error;
pub mod metrics;
pub mod probe;
pub mod scrape;
pub mod store;

pub use cache::CachedProbe;
pub use error::{ProbeError, ProbeResult};
pub use metrics::MetricsBackplane;
pub use probe::{BackplaneProbe, QueueReading, QueueSample};
pub use store::StoreBackplane;
