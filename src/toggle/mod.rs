//! Toggle Lifecycle
//!
//! - [`table`]: the declarative subsystem table and desired-state defaults
//! - [`lifecycle`]: the per-subsystem decision and its dispatch

pub mod lifecycle;
pub mod table;

pub use lifecycle::{decide, Decision, Outcome, SubsystemDriver};
pub use table::{ApiRequirement, DefaultState, Lifecycle, Subsystem, SubsystemTable};
