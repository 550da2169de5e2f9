//! Kubernetes Resource Store Adapter
//!
//! Drives the API server through dynamic `Api<DynamicObject>` handles for
//! rendered resources and a typed `Api<ClusterEngine>` for the desired
//! state. Forced server-side apply provides the declarative-merge contract.

use crate::crd::ClusterEngine;
use crate::domain::{ResourceRef, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

// =============================================================================
// Kube Store
// =============================================================================

/// Resource store backed by a live API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn dynamic_api(&self, target: &ResourceRef) -> Api<DynamicObject> {
        let ar = target.api_resource();
        match target.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn engines(&self) -> Api<ClusterEngine> {
        Api::all(self.client.clone())
    }
}

/// Translate API status codes into the operator's error taxonomy
fn store_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ref response) if response.code == 409 => {
            if response.reason == "AlreadyExists" {
                Error::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            } else {
                Error::Conflict {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
        }
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, target: &ResourceRef) -> Result<Option<DynamicObject>> {
        self.dynamic_api(target)
            .get_opt(&target.name)
            .await
            .map_err(|e| store_error(e, &target.kind, &target.qualified_name()))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let target = ResourceRef::from_object(obj)?;
        debug!("Creating {}", target);
        self.dynamic_api(&target)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| store_error(e, &target.kind, &target.qualified_name()))
    }

    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject> {
        let target = ResourceRef::from_object(obj)?;
        debug!("Applying {}", target);
        let params = PatchParams::apply(field_manager).force();
        self.dynamic_api(&target)
            .patch(&target.name, &params, &Patch::Apply(obj))
            .await
            .map_err(|e| store_error(e, &target.kind, &target.qualified_name()))
    }

    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        debug!("Deleting {}", target);
        self.dynamic_api(target)
            .delete(&target.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| store_error(e, &target.kind, &target.qualified_name()))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let target = ResourceRef {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: String::new(),
        };
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .dynamic_api(&target)
            .list(&params)
            .await
            .map_err(|e| store_error(e, kind, ""))?;
        Ok(list.items)
    }

    async fn get_engine(&self, name: &str) -> Result<Option<ClusterEngine>> {
        self.engines()
            .get_opt(name)
            .await
            .map_err(|e| store_error(e, "ClusterEngine", name))
    }

    async fn replace_engine(&self, engine: &ClusterEngine) -> Result<ClusterEngine> {
        let name = engine.name_any();
        self.engines()
            .replace(&name, &PostParams::default(), engine)
            .await
            .map_err(|e| store_error(e, "ClusterEngine", &name))
    }

    async fn replace_engine_status(&self, engine: &ClusterEngine) -> Result<ClusterEngine> {
        let name = engine.name_any();
        let body = serde_json::to_vec(engine)?;
        self.engines()
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| store_error(e, "ClusterEngine", &name))
    }

    async fn api_installed(&self, api_version: &str, kind: &str) -> Result<bool> {
        let listed = if api_version.contains('/') {
            self.client.list_api_group_resources(api_version).await
        } else {
            self.client.list_core_api_resources(api_version).await
        };
        match listed {
            Ok(list) => Ok(list.resources.iter().any(|r| r.kind == kind)),
            Err(kube::Error::Api(ref response)) if response.code == 404 => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
