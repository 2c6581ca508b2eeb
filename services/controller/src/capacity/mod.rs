//! Pool capacity control.
//!
//! Each pass:
//! - Validates the capacity bounds and refuses to act on contradictory ones
//! - Settles in-flight intents against the cache
//! - Plans creates and deletes from the observed pod set
//! - Applies the plan and writes the pool status

mod controller;
mod expectations;
mod planner;

pub use controller::CapacityController;
pub use expectations::{Expectations, InFlight, EXPECTATION_TTL};
pub use planner::{plan, pod_names, validate, CapacityPlan, PoolCounts};
