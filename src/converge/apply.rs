//! Apply and remove
//!
//! Every rendered resource goes through [`Converger::converge`]: owner
//! reference stamping, then either create-if-absent or a forced declarative
//! merge. [`Converger::remove`] is the inverse and treats absence as success.

use kube::api::DynamicObject;
use kube::Resource;
use tracing::{debug, info};

use crate::crd::ClusterEngine;
use crate::domain::{ResourceRef, ResourceStoreRef};
use crate::error::{Error, Result};

/// Field manager recorded on every forced apply
pub const FIELD_MANAGER: &str = "cluster-engine-operator";

/// (kind, name) pairs that must survive the owning engine
const OWNER_EXEMPT: &[(&str, &str)] = &[("ManagedClusterAddOn", "hypershift-addon")];

/// Kinds that are created once and never overwritten
const CREATE_ONLY_KINDS: &[&str] = &["APIService"];

pub fn is_owner_exempt(target: &ResourceRef) -> bool {
    OWNER_EXEMPT
        .iter()
        .any(|(kind, name)| target.kind == *kind && target.name == *name)
}

pub fn is_create_only(target: &ResourceRef) -> bool {
    CREATE_ONLY_KINDS.contains(&target.kind.as_str())
}

/// Drives rendered resources into the resource store
#[derive(Clone)]
pub struct Converger {
    store: ResourceStoreRef,
    field_manager: String,
}

impl Converger {
    pub fn new(store: ResourceStoreRef) -> Self {
        Self {
            store,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    pub fn store(&self) -> &ResourceStoreRef {
        &self.store
    }

    /// Converge one resource towards its rendered form
    pub async fn converge(&self, owner: &ClusterEngine, mut obj: DynamicObject) -> Result<()> {
        let target = ResourceRef::from_object(&obj)?;

        if !is_owner_exempt(&target) {
            let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
                Error::Internal(format!(
                    "ClusterEngine {} has no uid to reference from {}",
                    owner.metadata.name.as_deref().unwrap_or_default(),
                    target
                ))
            })?;
            obj.metadata.owner_references = Some(vec![owner_ref]);
        }

        if is_create_only(&target) {
            return self.create_if_absent(&target, &obj).await;
        }

        self.store.apply(&obj, &self.field_manager).await?;
        debug!("Applied {}", target);
        Ok(())
    }

    /// Converge resources in order, stopping at the first failure
    pub async fn converge_all(&self, owner: &ClusterEngine, objects: Vec<DynamicObject>) -> Result<()> {
        for obj in objects {
            self.converge(owner, obj).await?;
        }
        Ok(())
    }

    async fn create_if_absent(&self, target: &ResourceRef, obj: &DynamicObject) -> Result<()> {
        if self.store.get(target).await?.is_some() {
            debug!("{} already exists, leaving it untouched", target);
            return Ok(());
        }

        match self.store.create(obj).await {
            Ok(_) => {
                info!("Created {}", target);
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove one resource; absence is the goal state
    pub async fn remove(&self, obj: &DynamicObject) -> Result<()> {
        let target = ResourceRef::from_object(obj)?;
        self.remove_ref(&target).await
    }

    pub async fn remove_ref(&self, target: &ResourceRef) -> Result<()> {
        let existing = match self.store.get(target).await? {
            Some(existing) => existing,
            None => return Ok(()),
        };

        if existing.metadata.deletion_timestamp.is_some() {
            debug!("{} is already terminating", target);
            return Ok(());
        }

        match self.store.delete(target).await {
            Ok(()) => {
                info!("Deleted {}", target);
                Ok(())
            }
            Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove resources in order, stopping at the first failure
    pub async fn remove_all(&self, objects: &[DynamicObject]) -> Result<()> {
        for obj in objects {
            self.remove(obj).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterEngineSpec;
    use crate::domain::ResourceStore;
    use crate::store::{InMemoryStore, StoreOp};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    fn object(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn deployment() -> DynamicObject {
        object(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "discovery-operator", "namespace": "engine-ns"},
            "spec": {"replicas": 1}
        }))
    }

    async fn setup() -> (Arc<InMemoryStore>, Converger, ClusterEngine) {
        let store = Arc::new(InMemoryStore::new());
        let engine = store
            .insert_engine(ClusterEngine::new("engine", ClusterEngineSpec::default()))
            .await
            .unwrap();
        let converger = Converger::new(store.clone());
        (store, converger, engine)
    }

    #[tokio::test]
    async fn test_converge_sets_owner_reference() {
        let (store, converger, engine) = setup().await;
        converger.converge(&engine, deployment()).await.unwrap();

        let target = ResourceRef::from_object(&deployment()).unwrap();
        let stored = store.get(&target).await.unwrap().unwrap();
        let owners = stored.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "ClusterEngine");
        assert_eq!(owners[0].name, "engine");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[tokio::test]
    async fn test_converge_twice_is_a_noop() {
        let (store, converger, engine) = setup().await;
        let target = ResourceRef::from_object(&deployment()).unwrap();

        converger.converge(&engine, deployment()).await.unwrap();
        let first = store.get(&target).await.unwrap().unwrap();
        store.clear_journal();

        converger.converge(&engine, deployment()).await.unwrap();
        let second = store.get(&target).await.unwrap().unwrap();

        assert!(store.journal().is_empty());
        assert_eq!(
            first.metadata.resource_version,
            second.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_converge_changed_field() {
        let (store, converger, engine) = setup().await;
        converger.converge(&engine, deployment()).await.unwrap();

        let mut changed = deployment();
        changed.data["spec"]["replicas"] = json!(3);
        converger.converge(&engine, changed).await.unwrap();

        let target = ResourceRef::from_object(&deployment()).unwrap();
        let stored = store.get(&target).await.unwrap().unwrap();
        assert_eq!(stored.data["spec"]["replicas"], 3);
        assert!(!store.journal().iter().any(|op| matches!(op, StoreOp::Deleted(_))));
    }

    #[tokio::test]
    async fn test_exempt_resource_has_no_owner() {
        let (store, converger, engine) = setup().await;
        let addon = object(json!({
            "apiVersion": "addon.open-cluster-management.io/v1alpha1",
            "kind": "ManagedClusterAddOn",
            "metadata": {"name": "hypershift-addon", "namespace": "local-cluster"}
        }));
        converger.converge(&engine, addon.clone()).await.unwrap();

        let stored = store
            .get(&ResourceRef::from_object(&addon).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.metadata.owner_references, None);
    }

    #[tokio::test]
    async fn test_create_only_kind_is_never_overwritten() {
        let (store, converger, engine) = setup().await;
        let apiservice = |priority: u32| {
            object(json!({
                "apiVersion": "apiregistration.k8s.io/v1",
                "kind": "APIService",
                "metadata": {"name": "v1beta1.proxy.open-cluster-management.io"},
                "spec": {"groupPriorityMinimum": priority}
            }))
        };

        converger.converge(&engine, apiservice(10000)).await.unwrap();
        converger.converge(&engine, apiservice(1)).await.unwrap();

        let stored = store
            .get(&ResourceRef::from_object(&apiservice(0)).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.data["spec"]["groupPriorityMinimum"], 10000);
        assert_eq!(
            store.journal(),
            vec![StoreOp::Created(ResourceRef::from_object(&apiservice(0)).unwrap())]
        );
    }

    #[tokio::test]
    async fn test_remove_absent_is_success() {
        let (store, converger, _) = setup().await;
        converger.remove(&deployment()).await.unwrap();
        assert!(store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_remove_present() {
        let (store, converger, engine) = setup().await;
        converger.converge(&engine, deployment()).await.unwrap();
        converger.remove(&deployment()).await.unwrap();

        assert!(
            !store
                .contains(&ResourceRef::from_object(&deployment()).unwrap())
                .await
        );
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let (store, converger, engine) = setup().await;
        let target = ResourceRef::from_object(&deployment()).unwrap();
        store.fail_writes_to(target, "admission webhook denied the request");

        assert_matches!(
            converger.converge(&engine, deployment()).await,
            Err(Error::Store(msg)) if msg.contains("denied")
        );
    }

    #[tokio::test]
    async fn test_owner_without_uid_is_rejected() {
        let (_, converger, _) = setup().await;
        let detached = ClusterEngine::new("engine", ClusterEngineSpec::default());

        assert_matches!(
            converger.converge(&detached, deployment()).await,
            Err(Error::Internal(_))
        );
    }
}
