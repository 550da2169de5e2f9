//! Cluster Engine Operator - Reconciliation and Convergence Engine
//!
//! A Kubernetes operator that drives a modular multicluster platform toward
//! the state declared by a single cluster-scoped `ClusterEngine` resource.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       Reconciliation Controller                      │
//! │   finalizer → defaults → preconditions → subsystems → status         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌────────────────┐   ┌──────────────────────┐  │
//! │  │ Toggle Table   │──▶│ Template       │──▶│ Convergence Engine   │  │
//! │  │ (subsystems)   │   │ Renderer       │   │ (apply / teardown)   │  │
//! │  └────────────────┘   └────────────────┘   └──────────┬───────────┘  │
//! │                                                       │              │
//! │  ┌────────────────────────────────────┐               │              │
//! │  │ Status Aggregation Tree            │◀──────────────┤              │
//! │  │ (presence / ready / multi / ...)   │               │              │
//! │  └────────────────────────────────────┘               │              │
//! ├───────────────────────────────────────────────────────┴──────────────┤
//! │                        Resource Store Client                         │
//! │        ┌──────────────────────┐   ┌──────────────────────┐           │
//! │        │  Kubernetes (kube)   │   │      In-memory       │           │
//! │        └──────────────────────┘   └──────────────────────┘           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`crd`]: the `ClusterEngine` custom resource
//! - [`domain`]: resource references and the consumed ports
//! - [`store`]: resource store adapters
//! - [`render`]: template bundles and rendering
//! - [`converge`]: apply, removal, and ordered teardown
//! - [`status`]: status reporters and condition aggregation
//! - [`toggle`]: subsystem table and toggle lifecycle
//! - [`controller`]: the reconcile pass and its runtime wiring
//! - [`config`]: environment settings and image resolution
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod converge;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod render;
pub mod status;
pub mod store;
pub mod toggle;
pub mod version;

// Re-export commonly used types
pub use config::{
    EnvImageResolver, EnvironmentConfig, ProcessEnvironment, StaticEnvironment,
    StaticImageResolver,
};

pub use controller::{
    reconcile_pass, Context, ContextBuilder, LoggingUpgradeGate, RecordingUpgradeGate, Requeue,
};

pub use converge::{Converger, TeardownPlan, TeardownProgress};

pub use crd::{
    ClusterEngine, ClusterEngineSpec, ClusterEngineStatus, ComponentToggle, Condition,
    ConditionStatus, EnginePhase,
};

pub use domain::{
    EnvironmentSource, ImageResolver, ImageTable, ResourceRef, ResourceStore, UpgradeGate,
    UpgradeSignal,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::{Metrics, PassOutcome};

pub use render::{BundleSource, TemplateRenderer, Values};

pub use status::{StatusReporter, StatusTracker};

pub use store::{InMemoryStore, KubeStore};

pub use toggle::{Subsystem, SubsystemTable};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
