//! Reconciliation Controller
//!
//! - [`context`]: collaborators shared by every pass
//! - [`reconciler`]: one reconcile pass, phase by phase
//! - [`upgrade`]: upgrade gate implementations
//! - [`runner`]: kube runtime wiring and the error policy

pub mod context;
pub mod reconciler;
pub mod runner;
pub mod upgrade;

use kube::runtime::controller::Action;
use std::time::Duration;

pub use context::{Context, ContextBuilder};
pub use reconciler::reconcile_pass;
pub use runner::{error_policy, reconcile, run};
pub use upgrade::{LoggingUpgradeGate, RecordingUpgradeGate};

/// Fixed cadence for retried passes
pub const REQUEUE_PERIOD: Duration = Duration::from_secs(15);

/// Delay between finalization attempts
pub const FINALIZER_RETRY: Duration = Duration::from_secs(5);

/// Default deadline for one pass
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);

/// When the object should be looked at again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Only on the next watch event
    None,
    After(Duration),
    Immediate,
}

impl Requeue {
    pub fn into_action(self) -> Action {
        match self {
            Requeue::None => Action::await_change(),
            Requeue::After(delay) => Action::requeue(delay),
            Requeue::Immediate => Action::requeue(Duration::ZERO),
        }
    }
}
