//! Status Aggregation
//!
//! - [`reporter`]: the five reporter variants and their verdicts
//! - [`tracker`]: the per-pass condition accumulator and the pure fold
//!   into the persisted status

pub mod reporter;
pub mod tracker;

pub use reporter::{CustomCheck, StatusReporter};
pub use tracker::{compose, PassState, StatusTracker};
