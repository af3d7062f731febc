//! farmscale-autoscale: queue-pressure driven worker scaling.
//!
//! Each tick the [`Reconciler`] samples every queue's depth through a
//! [`farmscale_backplane::CachedProbe`], lists its workers through a
//! [`farmscale_fleet::FleetInventory`], and asks the [`policy`] what to do.
//! A decision becomes a [`farmscale_state::ScaleIntent`] that is carried
//! out by a background actuation task against a
//! [`farmscale_fleet::FleetActuator`].
//!
//! # Scaling Algorithm
//!
//! ```text
//! depth     = pending + in_progress
//! desired   = clamp(ceil(depth / target_actions_per_worker), min, max)
//! effective = ready + provisioning * provisioning_weight
//!
//! if desired > effective and sample fresh and up-cooldown elapsed:
//!     Up(min(ceil(desired - effective), max - non_terminated))
//!
//! if desired < ready and down-cooldown elapsed and depth trend flat/falling:
//!     Down(oldest ready workers, ready - desired)   // 1 when sample stale
//! ```
//!
//! # Queue phases
//!
//! ```text
//!        IntentIssued(Up)            IntentIssued(Down)
//!  Idle ───────────────► ScalingUp   Idle ───────────────► ScalingDown
//!   ▲                        │        ▲                         │
//!   └──── IntentResolved ────┘        └───── IntentResolved ────┘
//! ```
//!
//! A queue that is not Idle is not evaluated. At most one intent per queue
//! is outstanding.

pub mod backoff;
pub mod events;
pub mod policy;
pub mod readiness;
pub mod reconciler;
pub mod tracker;

pub use backoff::Backoff;
pub use events::{EventKind, EventLog, ScaleEvent};
pub use policy::{Decision, DecisionHistory, Hold, Trend};
pub use readiness::Readiness;
pub use reconciler::{QueueOutcome, Reconciler, TickReport};
pub use tracker::{Evaluation, IntentTracker, PhaseEvent, QueuePhase, QueueView, TransitionError};
