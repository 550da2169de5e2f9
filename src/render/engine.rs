//! Template renderer
//!
//! Renders each fragment of a bundle with minijinja in strict mode, parses
//! the output as a single YAML document, and stamps the management labels
//! and target namespace onto the resulting object.
//!
//! Rendering is pure: the same bundle and [`Values`] always produce the same
//! objects, in fragment order.

use kube::api::DynamicObject;
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde_json::Value;
use std::collections::BTreeMap;

use super::bundle::{Fragment, TemplateBundle, SHARED_TEMPLATES};
use super::filters;
use super::values::Values;
use super::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, NAMESPACED_KINDS, NAME_LABEL};
use crate::error::{Error, Result};

/// Strict-mode manifest renderer
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer").finish_non_exhaustive()
    }
}

impl TemplateRenderer {
    /// Create a renderer with the shared macro templates registered
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_filter("quote", filters::quote);

        for (name, source) in SHARED_TEMPLATES {
            env.add_template(name, source)
                .map_err(|source| Error::TemplateEvaluation {
                    bundle: "shared".to_string(),
                    fragment: name.to_string(),
                    source,
                })?;
        }

        Ok(Self { env })
    }

    /// Render every fragment of a bundle, stopping at the first failure
    pub fn render(&self, bundle: &TemplateBundle, values: &Values) -> Result<Vec<DynamicObject>> {
        if bundle.is_empty() {
            return Err(Error::EmptyBundle {
                bundle: bundle.name.clone(),
            });
        }

        bundle
            .fragments
            .iter()
            .map(|fragment| self.render_fragment(&bundle.name, fragment, values))
            .collect()
    }

    /// Render a single fragment into one object
    pub fn render_fragment(
        &self,
        bundle: &str,
        fragment: &Fragment,
        values: &Values,
    ) -> Result<DynamicObject> {
        let template_name = format!("{}/{}", bundle, fragment.name);
        let rendered = self
            .env
            .render_named_str(&template_name, &fragment.source, values)
            .map_err(|source| Error::TemplateEvaluation {
                bundle: bundle.to_string(),
                fragment: fragment.name.clone(),
                source,
            })?;

        if rendered.trim().is_empty() {
            return Err(Error::EmptyRender {
                bundle: bundle.to_string(),
                fragment: fragment.name.clone(),
            });
        }

        let malformed = |reason: String| Error::MalformedDocument {
            bundle: bundle.to_string(),
            fragment: fragment.name.clone(),
            reason,
        };

        let document: Value =
            serde_yaml::from_str(&rendered).map_err(|e| malformed(e.to_string()))?;
        check_identity(&document).map_err(malformed)?;

        let mut obj: DynamicObject =
            serde_json::from_value(document).map_err(|e| malformed(e.to_string()))?;
        stamp(&mut obj, values);
        Ok(obj)
    }
}

/// A renderable document names its apiVersion, kind and metadata.name
fn check_identity(document: &Value) -> std::result::Result<(), String> {
    if !document.is_object() {
        return Err("document is not a mapping".to_string());
    }
    for (path, value) in [
        ("apiVersion", document.get("apiVersion")),
        ("kind", document.get("kind")),
        (
            "metadata.name",
            document.get("metadata").and_then(|m| m.get("name")),
        ),
    ] {
        match value.and_then(Value::as_str) {
            Some(s) if !s.is_empty() => {}
            _ => return Err(format!("missing {}", path)),
        }
    }
    Ok(())
}

fn stamp(obj: &mut DynamicObject, values: &Values) {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
    if NAMESPACED_KINDS.contains(&kind) {
        obj.metadata.namespace = Some(values.namespace.clone());
    }

    let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(NAME_LABEL.to_string(), values.engine_name.clone());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentConfig;
    use crate::crd::{ClusterEngine, ClusterEngineSpec};
    use crate::domain::{ImageTable, ResourceRef};
    use crate::render::BundleSource;
    use assert_matches::assert_matches;

    fn values() -> Values {
        let engine = ClusterEngine::new(
            "engine",
            ClusterEngineSpec {
                target_namespace: "engine-ns".into(),
                ..Default::default()
            },
        );
        let images = ImageTable::from([(
            "discovery_operator".to_string(),
            "quay.io/stolostron/discovery-operator:2.5".to_string(),
        )]);
        Values::build(&engine, &EnvironmentConfig::default(), &images)
    }

    fn container(obj: &DynamicObject) -> &Value {
        &obj.data["spec"]["template"]["spec"]["containers"][0]
    }

    #[test]
    fn test_render_discovery_bundle() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = BundleSource::Embedded.load("discovery").unwrap();

        let objects = renderer.render(&bundle, &values()).unwrap();

        let refs: Vec<_> = objects
            .iter()
            .map(|o| ResourceRef::from_object(o).unwrap())
            .collect();
        assert_eq!(
            refs,
            [
                ResourceRef::namespaced("v1", "ServiceAccount", "engine-ns", "discovery-operator"),
                ResourceRef::namespaced("apps/v1", "Deployment", "engine-ns", "discovery-operator"),
                ResourceRef::namespaced("v1", "Service", "engine-ns", "discovery-operator-metrics"),
            ]
        );

        let deployment = &objects[1];
        assert_eq!(
            container(deployment)["image"],
            "quay.io/stolostron/discovery-operator:2.5"
        );
        assert_eq!(container(deployment)["imagePullPolicy"], "IfNotPresent");

        let labels = deployment.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(NAME_LABEL).unwrap(), "engine");
        assert_eq!(labels.get(MANAGED_BY_LABEL).unwrap(), MANAGED_BY_VALUE);
    }

    #[test]
    fn test_render_placement() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = BundleSource::Embedded.load("discovery").unwrap();
        let mut values = values();
        values.pull_secret = "pull-secret".into();
        values.node_selector.insert("zone".into(), "east".into());
        values
            .proxy_configs
            .insert("HTTP_PROXY".into(), "http://proxy:3128".into());

        let objects = renderer.render(&bundle, &values).unwrap();
        let pod = &objects[1].data["spec"]["template"]["spec"];

        assert_eq!(pod["imagePullSecrets"][0]["name"], "pull-secret");
        assert_eq!(pod["nodeSelector"]["zone"], "east");
        assert_eq!(pod["tolerations"][0]["key"], "dedicated");
        assert_eq!(pod["tolerations"][1]["effect"], "NoSchedule");

        let env = pod["containers"][0]["env"].as_array().unwrap();
        assert!(env
            .iter()
            .any(|e| e["name"] == "HTTP_PROXY" && e["value"] == "http://proxy:3128"));
    }

    #[test]
    fn test_scalars_with_quotes_and_newlines_survive() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = BundleSource::Embedded.load("discovery").unwrap();
        let mut values = values();
        values
            .proxy_configs
            .insert("NO_PROXY".into(), "a.local,\"b\".local\nc.local".into());
        values.node_selector.insert("label: with colon".into(), "x'y".into());

        let objects = renderer.render(&bundle, &values).unwrap();
        let pod = &objects[1].data["spec"]["template"]["spec"];

        assert_eq!(pod["nodeSelector"]["label: with colon"], "x'y");
        let env = pod["containers"][0]["env"].as_array().unwrap();
        assert!(env
            .iter()
            .any(|e| e["name"] == "NO_PROXY" && e["value"] == "a.local,\"b\".local\nc.local"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = BundleSource::Embedded.load("discovery").unwrap();

        let first = serde_json::to_string(&renderer.render(&bundle, &values()).unwrap()).unwrap();
        let second = serde_json::to_string(&renderer.render(&bundle, &values()).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_image_fails_evaluation() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = BundleSource::Embedded.load("hive").unwrap();

        assert_matches!(
            renderer.render(&bundle, &values()),
            Err(Error::TemplateEvaluation { bundle, fragment, .. })
                if bundle == "hive" && fragment == "deployment.yaml"
        );
    }

    #[test]
    fn test_empty_render() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = TemplateBundle::new("custom").with_fragment("blank.yaml", "{% if false %}x{% endif %}\n");

        assert_matches!(
            renderer.render(&bundle, &values()),
            Err(Error::EmptyRender { fragment, .. }) if fragment == "blank.yaml"
        );
    }

    #[test]
    fn test_malformed_documents() {
        let renderer = TemplateRenderer::new().unwrap();

        let not_a_mapping = TemplateBundle::new("custom").with_fragment("list.yaml", "- a\n- b\n");
        assert_matches!(
            renderer.render(&not_a_mapping, &values()),
            Err(Error::MalformedDocument { reason, .. }) if reason == "document is not a mapping"
        );

        let unnamed = TemplateBundle::new("custom")
            .with_fragment("cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n");
        assert_matches!(
            renderer.render(&unnamed, &values()),
            Err(Error::MalformedDocument { reason, .. }) if reason == "missing metadata.name"
        );

        let broken = TemplateBundle::new("custom").with_fragment("bad.yaml", "kind: [unclosed\n");
        assert_matches!(
            renderer.render(&broken, &values()),
            Err(Error::MalformedDocument { .. })
        );
    }

    #[test]
    fn test_first_failure_wins() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = TemplateBundle::new("custom")
            .with_fragment("ok.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n")
            .with_fragment("blank.yaml", "   \n")
            .with_fragment("undefined.yaml", "{{ nothing.here }}");

        assert_matches!(
            renderer.render(&bundle, &values()),
            Err(Error::EmptyRender { fragment, .. }) if fragment == "blank.yaml"
        );
    }

    #[test]
    fn test_namespace_is_overridden_for_namespaced_kinds() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = TemplateBundle::new("custom").with_fragment(
            "cm.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: elsewhere\n",
        );

        let objects = renderer.render(&bundle, &values()).unwrap();
        assert_eq!(objects[0].metadata.namespace.as_deref(), Some("engine-ns"));
    }

    #[test]
    fn test_unlisted_kind_keeps_its_namespace() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = BundleSource::Embedded.load("hypershift-local-hosting").unwrap();

        let objects = renderer.render(&bundle, &values()).unwrap();
        assert_eq!(objects[0].metadata.namespace.as_deref(), Some("local-cluster"));
    }

    #[test]
    fn test_cluster_scoped_kinds_have_no_namespace() {
        let renderer = TemplateRenderer::new().unwrap();
        let bundle = BundleSource::Embedded.load("local-cluster").unwrap();

        let objects = renderer.render(&bundle, &values()).unwrap();
        assert_eq!(objects[0].metadata.namespace, None);
    }
}
