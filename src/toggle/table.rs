//! Subsystem table
//!
//! Every subsystem the engine knows about, with the bundle it renders from
//! and how it is switched on. The reconcile pass iterates this table; it
//! never branches on a subsystem name.

use tracing::info;

use crate::config::EnvironmentConfig;
use crate::crd::{ClusterEngine, DEFAULT_TARGET_NAMESPACE};
use crate::version::{MajorMinor, MIN_PLATFORM_VERSION};

pub const SERVER_FOUNDATION: &str = "server-foundation";
pub const DISCOVERY: &str = "discovery";
pub const HIVE: &str = "hive";
pub const CONSOLE_MCE: &str = "console-mce";
pub const MANAGED_SERVICEACCOUNT: &str = "managed-serviceaccount";
pub const CLUSTER_PROXY_ADDON: &str = "cluster-proxy-addon";
pub const CLUSTER_MANAGER: &str = "cluster-manager";
pub const HYPERSHIFT: &str = "hypershift";
pub const HYPERSHIFT_LOCAL_HOSTING: &str = "hypershift-local-hosting";
pub const LOCAL_CLUSTER: &str = "local-cluster";
pub const ADDONS: &str = "addons";
pub const CLUSTER_LIFECYCLE: &str = "cluster-lifecycle";
pub const ASSISTED_SERVICE: &str = "assisted-service";

/// Kind the addon registrations are created as
pub const ADDON_API: ApiRequirement = ApiRequirement {
    api_version: "addon.open-cluster-management.io/v1alpha1",
    kind: "ClusterManagementAddOn",
};

/// How a toggleable subsystem starts out when the spec does not mention it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultState {
    Enabled,
    Disabled,
    /// Enabled on platforms at or above the floor, forced off below it
    EnabledFrom(MajorMinor),
}

impl DefaultState {
    /// Whether the platform can run the subsystem at all. An unknown
    /// platform version is assumed capable.
    pub fn supported_on(&self, platform_version: &str) -> bool {
        match self {
            DefaultState::EnabledFrom(floor) => MajorMinor::parse(platform_version)
                .map(|v| v >= *floor)
                .unwrap_or(true),
            _ => true,
        }
    }

    fn initial(&self, platform_version: &str) -> bool {
        match self {
            DefaultState::Enabled => true,
            DefaultState::Disabled => false,
            DefaultState::EnabledFrom(_) => self.supported_on(platform_version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// Converged on every pass
    AlwaysOn,
    /// Enabled or disabled per desired state
    Toggleable {
        default: DefaultState,
        /// Subsystems that must also be enabled
        dependencies: Vec<&'static str>,
    },
}

/// An API the cluster must serve before a subsystem can be converged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiRequirement {
    pub api_version: &'static str,
    pub kind: &'static str,
}

/// One row of the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subsystem {
    pub name: &'static str,
    pub bundle: &'static str,
    pub lifecycle: Lifecycle,
    /// Converged by the hosted reconcile path
    pub hosted: bool,
    /// Skipped, and retried later, until the API is served
    pub requires_api: Option<ApiRequirement>,
}

impl Subsystem {
    pub fn always_on(name: &'static str) -> Self {
        Self {
            name,
            bundle: name,
            lifecycle: Lifecycle::AlwaysOn,
            hosted: false,
            requires_api: None,
        }
    }

    pub fn toggleable(name: &'static str, default: DefaultState) -> Self {
        Self {
            name,
            bundle: name,
            lifecycle: Lifecycle::Toggleable {
                default,
                dependencies: Vec::new(),
            },
            hosted: false,
            requires_api: None,
        }
    }

    pub fn with_bundle(mut self, bundle: &'static str) -> Self {
        self.bundle = bundle;
        self
    }

    pub fn depends_on(mut self, dependency: &'static str) -> Self {
        if let Lifecycle::Toggleable { dependencies, .. } = &mut self.lifecycle {
            dependencies.push(dependency);
        }
        self
    }

    pub fn hosted(mut self) -> Self {
        self.hosted = true;
        self
    }

    pub fn requires(mut self, api: ApiRequirement) -> Self {
        self.requires_api = Some(api);
        self
    }

    pub fn is_always_on(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::AlwaysOn)
    }

    pub fn dependencies(&self) -> &[&'static str] {
        match &self.lifecycle {
            Lifecycle::AlwaysOn => &[],
            Lifecycle::Toggleable { dependencies, .. } => dependencies,
        }
    }
}

/// Ordered set of subsystems
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemTable {
    subsystems: Vec<Subsystem>,
}

impl SubsystemTable {
    pub fn new(subsystems: Vec<Subsystem>) -> Self {
        Self { subsystems }
    }

    /// The hub platform
    pub fn hub() -> Self {
        Self::new(vec![
            Subsystem::always_on(SERVER_FOUNDATION),
            Subsystem::always_on(ADDONS).requires(ADDON_API),
            Subsystem::toggleable(CLUSTER_LIFECYCLE, DefaultState::Enabled),
            Subsystem::toggleable(DISCOVERY, DefaultState::Enabled),
            Subsystem::toggleable(HIVE, DefaultState::Enabled),
            Subsystem::toggleable(ASSISTED_SERVICE, DefaultState::Enabled),
            Subsystem::toggleable(CONSOLE_MCE, DefaultState::EnabledFrom(MIN_PLATFORM_VERSION)),
            Subsystem::toggleable(MANAGED_SERVICEACCOUNT, DefaultState::Enabled).hosted(),
            Subsystem::toggleable(CLUSTER_PROXY_ADDON, DefaultState::Enabled),
            Subsystem::toggleable(CLUSTER_MANAGER, DefaultState::Enabled).hosted(),
            Subsystem::toggleable(HYPERSHIFT, DefaultState::Enabled),
            Subsystem::toggleable(HYPERSHIFT_LOCAL_HOSTING, DefaultState::Enabled)
                .depends_on(HYPERSHIFT)
                .depends_on(LOCAL_CLUSTER),
            Subsystem::toggleable(LOCAL_CLUSTER, DefaultState::Enabled),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Subsystem> {
        self.subsystems.iter().find(|s| s.name == name)
    }

    pub fn always_on(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.iter().filter(|s| s.is_always_on())
    }

    pub fn toggleable(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.iter().filter(|s| !s.is_always_on())
    }

    pub fn hosted(&self) -> impl Iterator<Item = &Subsystem> {
        self.subsystems.iter().filter(|s| s.hosted)
    }

    /// Fill in under-specified fields of the desired state.
    ///
    /// Returns whether anything changed; the caller persists and requeues.
    pub fn apply_defaults(&self, engine: &mut ClusterEngine, env: &EnvironmentConfig) -> bool {
        let mut changed = false;

        if engine.spec.target_namespace.is_empty() {
            engine.spec.target_namespace = DEFAULT_TARGET_NAMESPACE.to_string();
            changed = true;
        }

        if engine.spec.availability_config.is_none() {
            engine.spec.availability_config = Some(Default::default());
            changed = true;
        }

        if dedupe_toggles(engine) {
            changed = true;
        }

        for subsystem in self.toggleable() {
            let Lifecycle::Toggleable { default, .. } = &subsystem.lifecycle else {
                continue;
            };
            match engine.toggle(subsystem.name) {
                None => {
                    engine.set_toggle(subsystem.name, default.initial(&env.platform_version));
                    changed = true;
                }
                Some(true) if !default.supported_on(&env.platform_version) => {
                    info!(
                        "Platform {} cannot run {}, disabling it",
                        env.platform_version, subsystem.name
                    );
                    engine.set_toggle(subsystem.name, false);
                    changed = true;
                }
                Some(_) => {}
            }
        }

        changed
    }
}

impl Default for SubsystemTable {
    fn default() -> Self {
        Self::hub()
    }
}

/// Drop repeated toggle names, keeping the first
fn dedupe_toggles(engine: &mut ClusterEngine) -> bool {
    let before = engine.spec.components.len();
    let mut seen = std::collections::BTreeSet::new();
    engine
        .spec
        .components
        .retain(|toggle| seen.insert(toggle.name.clone()));
    engine.spec.components.len() != before
}
