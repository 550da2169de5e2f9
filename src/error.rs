//! Error types for the Cluster Engine Operator
//!
//! Provides structured error types for the reconcile loop, the resource
//! store adapters, template rendering, convergence, and ordered teardown.

use std::time::Duration;
use thiserror::Error;

use crate::controller::{FINALIZER_RETRY, REQUEUE_PERIOD};

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Reconcile pass exceeded its deadline of {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Resource Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict writing {kind}/{name}: the object has been modified")]
    Conflict { kind: String, name: String },

    #[error("Store error: {0}")]
    Store(String),

    // =========================================================================
    // Rendering Errors
    // =========================================================================
    #[error("no files found in template bundle {bundle}")]
    EmptyBundle { bundle: String },

    #[error("error evaluating {bundle}/{fragment}: {source}")]
    TemplateEvaluation {
        bundle: String,
        fragment: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("rendered template is empty: {bundle}/{fragment}")]
    EmptyRender { bundle: String, fragment: String },

    #[error("error converting {bundle}/{fragment} to a resource: {reason}")]
    MalformedDocument {
        bundle: String,
        fragment: String,
        reason: String,
    },

    // =========================================================================
    // Convergence Errors
    // =========================================================================
    #[error("error ensuring {subsystem}: {source}")]
    Subsystem {
        subsystem: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Subsystems(String),

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Version parse error: {0}")]
    VersionParse(String),

    // =========================================================================
    // Teardown
    // =========================================================================
    #[error("{0}")]
    TeardownPending(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // The object is gone, nothing left to drive
            Error::NotFound { .. } => ErrorAction::NoRequeue,

            // Benign optimistic-concurrency loss
            Error::Conflict { .. } => ErrorAction::RequeueAfter(REQUEUE_PERIOD),

            Error::TeardownPending(_) => ErrorAction::RequeueAfter(FINALIZER_RETRY),

            // Pass-level failures retried on the fixed cadence
            Error::Precondition(_)
            | Error::VersionParse(_)
            | Error::Subsystem { .. }
            | Error::Subsystems(_)
            | Error::EmptyBundle { .. }
            | Error::TemplateEvaluation { .. }
            | Error::EmptyRender { .. }
            | Error::MalformedDocument { .. } => ErrorAction::RequeueAfter(REQUEUE_PERIOD),

            Error::Configuration(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Store(_) | Error::Timeout(_)
        )
    }

    /// Check if this error means the addressed object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Wrap an error as the failure of one subsystem
    pub fn in_subsystem(self, subsystem: impl Into<String>) -> Self {
        Error::Subsystem {
            subsystem: subsystem.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
