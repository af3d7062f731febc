//! Shared types used across farmscale crates.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Boxed future returned by the backplane, inventory and actuator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A resource-range property a worker must satisfy to serve a queue
/// (e.g. `min-cores` between 1 and 4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRange {
    pub name: String,
    pub min: u64,
    pub max: u64,
}

impl ResourceRange {
    pub fn new(name: &str, min: u64, max: u64) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Whether every range in `required` is satisfied by a property of the
/// same name in `offered`.
pub fn properties_match(required: &[ResourceRange], offered: &[ResourceRange]) -> bool {
    required.iter().all(|req| {
        offered
            .iter()
            .any(|o| o.name == req.name && o.min <= req.max && o.max >= req.min)
    })
}
