//! Enable/disable dispatch
//!
//! A subsystem's decision is made from the desired state alone. Enabled
//! subsystems are rendered and converged; disabled ones are rendered too, so
//! the pass knows exactly which resources must be absent, and removed.

use kube::api::DynamicObject;
use std::sync::Arc;
use tracing::{debug, warn};

use super::table::{Lifecycle, Subsystem};
use crate::converge::Converger;
use crate::crd::ClusterEngine;
use crate::error::{Error, Result};
use crate::render::{BundleSource, TemplateRenderer, Values};
use crate::status::StatusReporter;

/// What a pass does with one subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Enabled,
    Disabled,
    /// Requested, but a dependency is disabled
    DependencyUnmet { dependency: &'static str },
}

impl Decision {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Decision::Enabled)
    }
}

/// Decide from the desired state. An unmet dependency wins over an explicit
/// enable.
pub fn decide(subsystem: &Subsystem, engine: &ClusterEngine) -> Decision {
    match &subsystem.lifecycle {
        Lifecycle::AlwaysOn => Decision::Enabled,
        Lifecycle::Toggleable { dependencies, .. } => {
            if !engine.is_enabled(subsystem.name) {
                return Decision::Disabled;
            }
            match dependencies.iter().find(|dep| !engine.is_enabled(dep)) {
                Some(dependency) => Decision::DependencyUnmet { dependency },
                None => Decision::Enabled,
            }
        }
    }
}

/// Result of driving one subsystem
#[derive(Debug)]
pub struct Outcome {
    pub subsystem: &'static str,
    /// Absent when rendering failed, since nothing is known about the resources
    pub reporter: Option<StatusReporter>,
    pub result: Result<()>,
}

impl Outcome {
    fn failed(subsystem: &'static str, error: Error) -> Self {
        Self {
            subsystem,
            reporter: None,
            result: Err(error.in_subsystem(subsystem)),
        }
    }
}

/// Renders subsystem bundles and hands them to the converger
#[derive(Clone)]
pub struct SubsystemDriver {
    renderer: Arc<TemplateRenderer>,
    converger: Converger,
    bundles: BundleSource,
}

impl SubsystemDriver {
    pub fn new(renderer: Arc<TemplateRenderer>, converger: Converger, bundles: BundleSource) -> Self {
        Self {
            renderer,
            converger,
            bundles,
        }
    }

    pub fn converger(&self) -> &Converger {
        &self.converger
    }

    pub fn render(&self, subsystem: &Subsystem, values: &Values) -> Result<Vec<DynamicObject>> {
        let bundle = self.bundles.load(subsystem.bundle)?;
        self.renderer.render(&bundle, values)
    }

    /// Apply a decision
    pub async fn run(
        &self,
        subsystem: &Subsystem,
        decision: &Decision,
        engine: &ClusterEngine,
        values: &Values,
    ) -> Outcome {
        match decision {
            Decision::Enabled => self.ensure_present(subsystem, engine, values).await,
            Decision::Disabled => self.ensure_absent(subsystem, values, None).await,
            Decision::DependencyUnmet { dependency } => {
                let note = format!(
                    "{} only available when {} is enabled",
                    subsystem.name, dependency
                );
                self.ensure_absent(subsystem, values, Some(note)).await
            }
        }
    }

    /// Render and converge every resource of the subsystem
    pub async fn ensure_present(
        &self,
        subsystem: &Subsystem,
        engine: &ClusterEngine,
        values: &Values,
    ) -> Outcome {
        let objects = match self.render(subsystem, values) {
            Ok(objects) => objects,
            Err(e) => return Outcome::failed(subsystem.name, e),
        };

        let reporter = match StatusReporter::enabled(subsystem.name, &objects) {
            Ok(reporter) => reporter,
            Err(e) => return Outcome::failed(subsystem.name, e),
        };

        let result = self
            .converger
            .converge_all(engine, objects)
            .await
            .map_err(|e| e.in_subsystem(subsystem.name));
        if let Err(e) = &result {
            warn!("{}", e);
        } else {
            debug!("Subsystem {} converged", subsystem.name);
        }

        Outcome {
            subsystem: subsystem.name,
            reporter: Some(reporter),
            result,
        }
    }

    /// Render the subsystem and remove whatever of it exists
    pub async fn ensure_absent(
        &self,
        subsystem: &Subsystem,
        values: &Values,
        note: Option<String>,
    ) -> Outcome {
        let objects = match self.render(subsystem, values) {
            Ok(objects) => objects,
            Err(e) => return Outcome::failed(subsystem.name, e),
        };

        let reporter = match StatusReporter::disabled(subsystem.name, &objects) {
            Ok(reporter) => match note {
                Some(note) => reporter.with_note(note),
                None => reporter,
            },
            Err(e) => return Outcome::failed(subsystem.name, e),
        };

        let result = self
            .converger
            .remove_all(&objects)
            .await
            .map_err(|e| e.in_subsystem(subsystem.name));
        if let Err(e) = &result {
            warn!("{}", e);
        }

        Outcome {
            subsystem: subsystem.name,
            reporter: Some(reporter),
            result,
        }
    }
}
