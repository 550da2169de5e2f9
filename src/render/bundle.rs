//! Template bundles
//!
//! A bundle is the ordered set of manifest templates for one subsystem.
//! Bundles ship embedded in the binary; a directory override replaces them
//! wholesale for development clusters.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Templates importable from every bundle, as (name, source)
pub const SHARED_TEMPLATES: &[(&str, &str)] =
    &[("pod.yaml", include_str!("../../templates/_shared/pod.yaml"))];

type EmbeddedBundle = (&'static str, &'static [(&'static str, &'static str)]);

const EMBEDDED: &[EmbeddedBundle] = &[
    (
        "server-foundation",
        &[
            (
                "serviceaccount.yaml",
                include_str!("../../templates/server-foundation/serviceaccount.yaml"),
            ),
            (
                "deployment.yaml",
                include_str!("../../templates/server-foundation/deployment.yaml"),
            ),
            (
                "service.yaml",
                include_str!("../../templates/server-foundation/service.yaml"),
            ),
            (
                "apiservice.yaml",
                include_str!("../../templates/server-foundation/apiservice.yaml"),
            ),
        ],
    ),
    (
        "discovery",
        &[
            (
                "serviceaccount.yaml",
                include_str!("../../templates/discovery/serviceaccount.yaml"),
            ),
            (
                "deployment.yaml",
                include_str!("../../templates/discovery/deployment.yaml"),
            ),
            (
                "service.yaml",
                include_str!("../../templates/discovery/service.yaml"),
            ),
        ],
    ),
    (
        "hive",
        &[
            (
                "serviceaccount.yaml",
                include_str!("../../templates/hive/serviceaccount.yaml"),
            ),
            (
                "deployment.yaml",
                include_str!("../../templates/hive/deployment.yaml"),
            ),
        ],
    ),
    (
        "console-mce",
        &[
            (
                "deployment.yaml",
                include_str!("../../templates/console-mce/deployment.yaml"),
            ),
            (
                "service.yaml",
                include_str!("../../templates/console-mce/service.yaml"),
            ),
        ],
    ),
    (
        "managed-serviceaccount",
        &[
            (
                "serviceaccount.yaml",
                include_str!("../../templates/managed-serviceaccount/serviceaccount.yaml"),
            ),
            (
                "deployment.yaml",
                include_str!("../../templates/managed-serviceaccount/deployment.yaml"),
            ),
        ],
    ),
    (
        "cluster-proxy-addon",
        &[
            (
                "deployment-manager.yaml",
                include_str!("../../templates/cluster-proxy-addon/deployment-manager.yaml"),
            ),
            (
                "deployment-user.yaml",
                include_str!("../../templates/cluster-proxy-addon/deployment-user.yaml"),
            ),
        ],
    ),
    (
        "cluster-manager",
        &[
            (
                "deployment.yaml",
                include_str!("../../templates/cluster-manager/deployment.yaml"),
            ),
            (
                "clustermanager.yaml",
                include_str!("../../templates/cluster-manager/clustermanager.yaml"),
            ),
        ],
    ),
    (
        "addons",
        &[
            (
                "work-manager.yaml",
                include_str!("../../templates/addons/work-manager.yaml"),
            ),
            (
                "managed-serviceaccount.yaml",
                include_str!("../../templates/addons/managed-serviceaccount.yaml"),
            ),
            (
                "hypershift-addon.yaml",
                include_str!("../../templates/addons/hypershift-addon.yaml"),
            ),
        ],
    ),
    (
        "cluster-lifecycle",
        &[
            (
                "serviceaccount.yaml",
                include_str!("../../templates/cluster-lifecycle/serviceaccount.yaml"),
            ),
            (
                "deployment.yaml",
                include_str!("../../templates/cluster-lifecycle/deployment.yaml"),
            ),
        ],
    ),
    (
        "assisted-service",
        &[
            (
                "serviceaccount.yaml",
                include_str!("../../templates/assisted-service/serviceaccount.yaml"),
            ),
            (
                "deployment.yaml",
                include_str!("../../templates/assisted-service/deployment.yaml"),
            ),
        ],
    ),
    (
        "hypershift",
        &[(
            "deployment.yaml",
            include_str!("../../templates/hypershift/deployment.yaml"),
        )],
    ),
    (
        "hypershift-local-hosting",
        &[(
            "managedclusteraddon.yaml",
            include_str!("../../templates/hypershift-local-hosting/managedclusteraddon.yaml"),
        )],
    ),
    (
        "local-cluster",
        &[(
            "managedcluster.yaml",
            include_str!("../../templates/local-cluster/managedcluster.yaml"),
        )],
    ),
];

/// One template file in a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub name: String,
    pub source: Cow<'static, str>,
}

/// Named, ordered set of manifest templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBundle {
    pub name: String,
    pub fragments: Vec<Fragment>,
}

impl TemplateBundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fragments: Vec::new(),
        }
    }

    /// Append a fragment; fragments render in insertion order
    pub fn with_fragment(
        mut self,
        name: impl Into<String>,
        source: impl Into<Cow<'static, str>>,
    ) -> Self {
        self.fragments.push(Fragment {
            name: name.into(),
            source: source.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Bundle compiled into the binary
    pub fn embedded(name: &str) -> Option<Self> {
        EMBEDDED
            .iter()
            .find(|(bundle, _)| *bundle == name)
            .map(|(bundle, fragments)| {
                fragments
                    .iter()
                    .fold(TemplateBundle::new(*bundle), |acc, (file, source)| {
                        acc.with_fragment(*file, Cow::Borrowed(*source))
                    })
            })
    }

    /// Names of every embedded bundle
    pub fn embedded_names() -> impl Iterator<Item = &'static str> {
        EMBEDDED.iter().map(|(name, _)| *name)
    }

    /// Load `<root>/<name>/*.yaml` in file-name order
    pub fn from_dir(name: &str, root: &Path) -> Result<Self> {
        let pattern = root.join(name).join("*.yaml");
        let pattern = pattern.to_string_lossy();
        let mut paths: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| Error::Configuration(format!("invalid bundle path {}: {}", pattern, e)))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut bundle = TemplateBundle::new(name);
        for path in paths {
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            let source = std::fs::read_to_string(&path)?;
            bundle = bundle.with_fragment(file, Cow::Owned(source));
        }
        debug!(
            "Loaded bundle {} from {} ({} fragments)",
            name,
            root.display(),
            bundle.fragments.len()
        );
        Ok(bundle)
    }
}

/// Where bundles are read from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BundleSource {
    #[default]
    Embedded,
    Directory(PathBuf),
}

impl BundleSource {
    /// Load a bundle; a bundle with no fragments is an error
    pub fn load(&self, name: &str) -> Result<TemplateBundle> {
        let bundle = match self {
            BundleSource::Embedded => {
                TemplateBundle::embedded(name).unwrap_or_else(|| TemplateBundle::new(name))
            }
            BundleSource::Directory(root) => TemplateBundle::from_dir(name, root)?,
        };
        if bundle.is_empty() {
            return Err(Error::EmptyBundle {
                bundle: name.to_string(),
            });
        }
        Ok(bundle)
    }
}
