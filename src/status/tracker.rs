//! EngineStatus accumulator
//!
//! One tracker lives for one reconcile pass. Phases push engine-level
//! conditions and subsystem reporters into it; at the end of the pass the
//! reporters are evaluated and [`compose`] folds everything into the
//! persisted [`ClusterEngineStatus`]. `compose` is pure so the status
//! rules can be tested without a store.

use indexmap::IndexMap;

use super::reporter::StatusReporter;
use crate::crd::{ClusterEngineStatus, Condition, ConditionKey, ConditionStatus, EnginePhase};
use crate::domain::ResourceStore;

/// Kind recorded on engine-level conditions
pub const ENGINE_KIND: &str = "ClusterEngine";

pub const PROGRESSING_TYPE: &str = "Progressing";
pub const UPGRADEABLE_TYPE: &str = "Upgradeable";
pub const DEPLOYED_TYPE: &str = "Deployed";

pub const PAUSED_REASON: &str = "Paused";
pub const PRECONDITION_FAILED_REASON: &str = "PreconditionFailed";
pub const DEPLOY_FAILED_REASON: &str = "DeployFailed";
pub const DEPLOY_SUCCESS_REASON: &str = "DeploySuccess";
pub const UPGRADE_BLOCKED_REASON: &str = "UpgradeInProgress";

/// Conditions and reporters collected during one pass
#[derive(Debug, Default)]
pub struct StatusTracker {
    conditions: IndexMap<ConditionKey, Condition>,
    reporters: Vec<StatusReporter>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.conditions.clear();
        self.reporters.clear();
    }

    /// Record a condition; a condition with the same key is replaced in place
    pub fn add_condition(&mut self, condition: Condition) {
        self.conditions.insert(condition.key(), condition);
    }

    pub fn add_reporter(&mut self, reporter: StatusReporter) {
        self.reporters.push(reporter);
    }

    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.values()
    }

    pub fn reporters(&self) -> &[StatusReporter] {
        &self.reporters
    }

    /// Recorded conditions followed by reporter verdicts, deduplicated by key
    pub async fn evaluate(&self, store: &dyn ResourceStore) -> Vec<Condition> {
        let mut merged = self.conditions.clone();
        for reporter in &self.reporters {
            let condition = reporter.evaluate(store).await;
            merged.insert(condition.key(), condition);
        }
        merged.into_values().collect()
    }
}

// =============================================================================
// Engine-level conditions
// =============================================================================

pub fn paused_condition(engine: &str) -> Condition {
    Condition::new(
        engine,
        ENGINE_KIND,
        PROGRESSING_TYPE,
        ConditionStatus::Unknown,
        PAUSED_REASON,
        "Reconciliation is paused",
    )
}

pub fn precondition_failed(engine: &str, message: impl Into<String>) -> Condition {
    Condition::new(
        engine,
        ENGINE_KIND,
        PROGRESSING_TYPE,
        ConditionStatus::False,
        PRECONDITION_FAILED_REASON,
        message,
    )
}

pub fn deploy_failed(engine: &str, message: impl Into<String>) -> Condition {
    Condition::new(
        engine,
        ENGINE_KIND,
        PROGRESSING_TYPE,
        ConditionStatus::False,
        DEPLOY_FAILED_REASON,
        message,
    )
}

pub fn all_deployed(engine: &str) -> Condition {
    Condition::new(
        engine,
        ENGINE_KIND,
        PROGRESSING_TYPE,
        ConditionStatus::True,
        DEPLOY_SUCCESS_REASON,
        "All components deployed",
    )
}

/// Failure converging one subsystem
pub fn subsystem_failed(subsystem: &str, message: impl Into<String>) -> Condition {
    Condition::new(
        subsystem,
        super::reporter::COMPONENT_KIND,
        DEPLOYED_TYPE,
        ConditionStatus::False,
        DEPLOY_FAILED_REASON,
        message,
    )
}

/// Informational; does not hold the engine out of the Available phase
pub fn upgrade_blocked(engine: &str, message: impl Into<String>) -> Condition {
    Condition::new(
        engine,
        ENGINE_KIND,
        UPGRADEABLE_TYPE,
        ConditionStatus::False,
        UPGRADE_BLOCKED_REASON,
        message,
    )
    .with_available(true)
}

// =============================================================================
// Compose
// =============================================================================

/// How the pass ended, as far as the phase is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Running,
    Paused,
    Deleting,
}

/// Fold a pass's conditions into the status to persist
pub fn compose(
    conditions: Vec<Condition>,
    state: PassState,
    previous: Option<&ClusterEngineStatus>,
    operator_version: &str,
) -> ClusterEngineStatus {
    let conditions: Vec<Condition> = conditions
        .into_iter()
        .map(|condition| carry_transition_time(condition, previous))
        .collect();

    let phase = match state {
        PassState::Paused => EnginePhase::Paused,
        PassState::Deleting => EnginePhase::Uninstalling,
        PassState::Running if !conditions.is_empty() && conditions.iter().all(|c| c.available) => {
            EnginePhase::Available
        }
        PassState::Running => EnginePhase::Progressing,
    };

    let current_version = if phase == EnginePhase::Available {
        Some(operator_version.to_string())
    } else {
        previous.and_then(|p| p.current_version.clone())
    };

    ClusterEngineStatus {
        phase,
        conditions,
        current_version,
        desired_version: Some(operator_version.to_string()),
    }
}

/// An unchanged status keeps the previous transition time
fn carry_transition_time(mut condition: Condition, previous: Option<&ClusterEngineStatus>) -> Condition {
    let prior = previous.and_then(|p| {
        p.conditions
            .iter()
            .find(|c| c.key() == condition.key())
    });
    if let Some(prior) = prior {
        if prior.status == condition.status && prior.last_transition_time.is_some() {
            condition.last_transition_time = prior.last_transition_time;
        }
    }
    condition
}
