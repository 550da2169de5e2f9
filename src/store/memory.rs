//! In-Memory Resource Store
//!
//! A resource store that keeps objects in process. It follows the API
//! server semantics the reconcile core relies on: resource versions that
//! only move on real changes, optimistic concurrency on the desired-state
//! object, finalizers that hold deleted objects in a terminating state, and
//! a merge-style apply. Used by the test suites and for dry runs.

use crate::crd::{ClusterEngine, API_VERSION};
use crate::domain::{ResourceRef, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

// =============================================================================
// Journal
// =============================================================================

/// A write that changed the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Created(ResourceRef),
    Applied(ResourceRef),
    Deleted(ResourceRef),
    EngineReplaced(String),
    EngineStatusReplaced(String),
}

impl StoreOp {
    pub fn target(&self) -> Option<&ResourceRef> {
        match self {
            StoreOp::Created(r) | StoreOp::Applied(r) | StoreOp::Deleted(r) => Some(r),
            StoreOp::EngineReplaced(_) | StoreOp::EngineStatusReplaced(_) => None,
        }
    }

    /// Whether this write touched a rendered resource rather than the engine
    pub fn is_resource_write(&self) -> bool {
        self.target().is_some()
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Process-local resource store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: RwLock<BTreeMap<ResourceRef, DynamicObject>>,
    revision: AtomicU64,
    journal: Mutex<Vec<StoreOp>>,
    write_faults: Mutex<BTreeMap<ResourceRef, String>>,
    read_faults: Mutex<BTreeMap<ResourceRef, String>>,
    /// Status writes still to be rejected with a conflict
    status_conflicts: AtomicUsize,
    read_delay: Mutex<Option<Duration>>,
    /// (apiVersion, kind) pairs the store does not serve
    missing_apis: Mutex<BTreeSet<(String, String)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, obj: &mut DynamicObject, creating: bool) {
        let revision = self.next_revision();
        if creating {
            obj.metadata.uid = Some(format!("uid-{}", revision));
            obj.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        obj.metadata.resource_version = Some(revision);
    }

    fn record(&self, op: StoreOp) {
        debug!("In-memory store write: {:?}", op);
        self.journal.lock().push(op);
    }

    fn check_write(&self, target: &ResourceRef) -> Result<()> {
        match self.write_faults.lock().get(target) {
            Some(message) => Err(Error::Store(message.clone())),
            None => Ok(()),
        }
    }

    fn check_read(&self, target: &ResourceRef) -> Result<()> {
        match self.read_faults.lock().get(target) {
            Some(message) => Err(Error::Store(message.clone())),
            None => Ok(()),
        }
    }

    /// Writes of an unserved kind fail the way the API server answers them
    fn check_served(&self, target: &ResourceRef) -> Result<()> {
        let key = (target.api_version.clone(), target.kind.clone());
        if self.missing_apis.lock().contains(&key) {
            return Err(not_found(target));
        }
        Ok(())
    }

    async fn read_latency(&self) {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_status_conflict(&self) -> bool {
        self.status_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    // =========================================================================
    // Test and seeding helpers
    // =========================================================================

    /// Seed an object without recording a write
    pub async fn insert(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = normalize(ResourceRef::from_object(&obj)?);
        self.stamp(&mut obj, true);
        self.objects.write().await.insert(key, obj.clone());
        Ok(obj)
    }

    /// Seed the desired-state object
    pub async fn insert_engine(&self, engine: ClusterEngine) -> Result<ClusterEngine> {
        let obj: DynamicObject = serde_json::from_value(serde_json::to_value(&engine)?)?;
        let stored = self.insert(obj).await?;
        to_engine(&stored)
    }

    /// Mark the desired-state object as deleted at the given instant
    pub async fn mark_engine_deleted(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let key = engine_ref(name);
        let mut objects = self.objects.write().await;
        let obj = objects.get_mut(&key).ok_or_else(|| not_found(&key))?;
        obj.metadata.deletion_timestamp = Some(Time(at));
        let revision = self.next_revision();
        obj.metadata.resource_version = Some(revision);
        Ok(())
    }

    /// Replace the `status` stanza of any object
    pub async fn set_status(&self, target: &ResourceRef, status: Value) -> Result<()> {
        let key = normalize(target.clone());
        let mut objects = self.objects.write().await;
        let obj = objects.get_mut(&key).ok_or_else(|| not_found(&key))?;
        if let Value::Object(map) = &mut obj.data {
            map.insert("status".to_string(), status);
        }
        let revision = self.next_revision();
        obj.metadata.resource_version = Some(revision);
        Ok(())
    }

    /// Add a finalizer so that deletion leaves the object terminating
    pub async fn add_finalizer(&self, target: &ResourceRef, finalizer: &str) -> Result<()> {
        let key = normalize(target.clone());
        let mut objects = self.objects.write().await;
        let obj = objects.get_mut(&key).ok_or_else(|| not_found(&key))?;
        obj.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        Ok(())
    }

    /// Drop all finalizers, completing a pending deletion
    pub async fn clear_finalizers(&self, target: &ResourceRef) -> Result<()> {
        let key = normalize(target.clone());
        let mut objects = self.objects.write().await;
        let terminating = match objects.get_mut(&key) {
            Some(obj) => {
                obj.metadata.finalizers = None;
                obj.metadata.deletion_timestamp.is_some()
            }
            None => return Err(not_found(&key)),
        };
        if terminating {
            objects.remove(&key);
        }
        Ok(())
    }

    /// Bump the resource version as if another writer touched the object
    pub async fn touch(&self, target: &ResourceRef) -> Result<()> {
        let key = normalize(target.clone());
        let mut objects = self.objects.write().await;
        let obj = objects.get_mut(&key).ok_or_else(|| not_found(&key))?;
        let revision = self.next_revision();
        obj.metadata.resource_version = Some(revision);
        Ok(())
    }

    pub async fn contains(&self, target: &ResourceRef) -> bool {
        self.objects.read().await.contains_key(&normalize(target.clone()))
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// All stored addresses in key order
    pub async fn refs(&self) -> Vec<ResourceRef> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Writes recorded since creation or the last `clear_journal`
    pub fn journal(&self) -> Vec<StoreOp> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Make every write to `target` fail with a store error
    pub fn fail_writes_to(&self, target: ResourceRef, message: impl Into<String>) {
        self.write_faults
            .lock()
            .insert(normalize(target), message.into());
    }

    /// Make every read of `target` fail with a store error
    pub fn fail_reads_of(&self, target: ResourceRef, message: impl Into<String>) {
        self.read_faults
            .lock()
            .insert(normalize(target), message.into());
    }

    /// Reject the next `count` status writes as if another writer won the race
    pub fn conflict_status_writes(&self, count: usize) {
        self.status_conflicts.store(count, Ordering::SeqCst);
    }

    /// Hold every object read for `delay`
    pub fn delay_reads(&self, delay: Duration) {
        *self.read_delay.lock() = Some(delay);
    }

    /// Stop serving a kind, as if its CRD were not installed
    pub fn remove_api(&self, api_version: &str, kind: &str) {
        self.missing_apis
            .lock()
            .insert((api_version.to_string(), kind.to_string()));
    }

    pub fn restore_api(&self, api_version: &str, kind: &str) {
        self.missing_apis
            .lock()
            .remove(&(api_version.to_string(), kind.to_string()));
    }

    pub fn clear_faults(&self) {
        self.write_faults.lock().clear();
        self.read_faults.lock().clear();
        self.status_conflicts.store(0, Ordering::SeqCst);
        *self.read_delay.lock() = None;
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, target: &ResourceRef) -> Result<Option<DynamicObject>> {
        let key = normalize(target.clone());
        self.read_latency().await;
        self.check_read(&key)?;
        Ok(self.objects.read().await.get(&key).cloned())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = normalize(ResourceRef::from_object(obj)?);
        self.check_served(&key)?;
        self.check_write(&key)?;

        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: key.kind.clone(),
                name: key.qualified_name(),
            });
        }

        let mut created = obj.clone();
        self.stamp(&mut created, true);
        objects.insert(key.clone(), created.clone());
        drop(objects);

        self.record(StoreOp::Created(key));
        Ok(created)
    }

    async fn apply(&self, obj: &DynamicObject, _field_manager: &str) -> Result<DynamicObject> {
        let key = normalize(ResourceRef::from_object(obj)?);
        self.check_served(&key)?;
        self.check_write(&key)?;

        let mut incoming = serde_json::to_value(obj)?;
        strip_server_fields(&mut incoming);

        let mut objects = self.objects.write().await;
        let (updated, op) = match objects.get(&key) {
            Some(existing) => {
                let current = serde_json::to_value(existing)?;
                let mut merged = current.clone();
                merge_json(&mut merged, &incoming);
                if merged == current {
                    return Ok(existing.clone());
                }
                let mut updated: DynamicObject = serde_json::from_value(merged)?;
                self.stamp(&mut updated, false);
                (updated, StoreOp::Applied(key.clone()))
            }
            None => {
                let mut created: DynamicObject = serde_json::from_value(incoming)?;
                self.stamp(&mut created, true);
                (created, StoreOp::Created(key.clone()))
            }
        };
        objects.insert(key, updated.clone());
        drop(objects);

        self.record(op);
        Ok(updated)
    }

    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        let key = normalize(target.clone());
        self.check_write(&key)?;

        let mut objects = self.objects.write().await;
        let held = match objects.get_mut(&key) {
            None => return Err(not_found(&key)),
            Some(obj) => {
                let has_finalizers = obj
                    .metadata
                    .finalizers
                    .as_ref()
                    .map(|f| !f.is_empty())
                    .unwrap_or(false);
                if has_finalizers && obj.metadata.deletion_timestamp.is_none() {
                    obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                    let revision = self.next_revision();
                    obj.metadata.resource_version = Some(revision);
                }
                has_finalizers
            }
        };
        if !held {
            objects.remove(&key);
        }
        drop(objects);

        self.record(StoreOp::Deleted(key));
        Ok(())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let requirements = label_selector.map(parse_selector).unwrap_or_default();
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(key, _)| key.api_version == api_version && key.kind == kind)
            .filter(|(key, _)| match namespace {
                Some(ns) => key.namespace.as_deref() == Some(ns),
                None => true,
            })
            .filter(|(_, obj)| matches_selector(obj, &requirements))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn get_engine(&self, name: &str) -> Result<Option<ClusterEngine>> {
        let key = engine_ref(name);
        self.read_latency().await;
        self.check_read(&key)?;
        match self.objects.read().await.get(&key) {
            Some(obj) => Ok(Some(to_engine(obj)?)),
            None => Ok(None),
        }
    }

    async fn replace_engine(&self, engine: &ClusterEngine) -> Result<ClusterEngine> {
        let name = engine.metadata.name.clone().unwrap_or_default();
        let key = engine_ref(&name);
        self.check_write(&key)?;

        let mut objects = self.objects.write().await;
        let existing = objects.get(&key).ok_or_else(|| not_found(&key))?;
        check_revision(existing, engine.metadata.resource_version.as_deref(), &name)?;

        let mut value = serde_json::to_value(engine)?;
        if let Value::Object(map) = &mut value {
            match existing.data.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        let mut updated: DynamicObject = serde_json::from_value(value)?;
        updated.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        updated.metadata.uid = existing.metadata.uid.clone();
        updated.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        self.stamp(&mut updated, false);

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated
                .metadata
                .finalizers
                .as_ref()
                .map(|f| f.is_empty())
                .unwrap_or(true);
        if released {
            objects.remove(&key);
        } else {
            objects.insert(key, updated.clone());
        }
        drop(objects);

        self.record(StoreOp::EngineReplaced(name));
        to_engine(&updated)
    }

    async fn replace_engine_status(&self, engine: &ClusterEngine) -> Result<ClusterEngine> {
        let name = engine.metadata.name.clone().unwrap_or_default();
        let key = engine_ref(&name);
        self.check_write(&key)?;
        if self.take_status_conflict() {
            return Err(Error::Conflict {
                kind: "ClusterEngine".to_string(),
                name,
            });
        }

        let mut objects = self.objects.write().await;
        let existing = objects.get(&key).ok_or_else(|| not_found(&key))?;
        check_revision(existing, engine.metadata.resource_version.as_deref(), &name)?;

        let mut updated = existing.clone();
        if let Value::Object(map) = &mut updated.data {
            match &engine.status {
                Some(status) => map.insert("status".to_string(), serde_json::to_value(status)?),
                None => map.remove("status"),
            };
        }
        self.stamp(&mut updated, false);
        objects.insert(key, updated.clone());
        drop(objects);

        self.record(StoreOp::EngineStatusReplaced(name));
        to_engine(&updated)
    }

    async fn api_installed(&self, api_version: &str, kind: &str) -> Result<bool> {
        let key = (api_version.to_string(), kind.to_string());
        Ok(!self.missing_apis.lock().contains(&key))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn engine_ref(name: &str) -> ResourceRef {
    ResourceRef::cluster(API_VERSION, "ClusterEngine", name)
}

fn normalize(mut target: ResourceRef) -> ResourceRef {
    if target.namespace.as_deref() == Some("") {
        target.namespace = None;
    }
    target
}

fn not_found(target: &ResourceRef) -> Error {
    Error::NotFound {
        kind: target.kind.clone(),
        name: target.qualified_name(),
    }
}

fn to_engine(obj: &DynamicObject) -> Result<ClusterEngine> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn check_revision(existing: &DynamicObject, submitted: Option<&str>, name: &str) -> Result<()> {
    if existing.metadata.resource_version.as_deref() != submitted {
        return Err(Error::Conflict {
            kind: "ClusterEngine".to_string(),
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Fields owned by the server; an apply never sets them
fn strip_server_fields(value: &mut Value) {
    if let Some(Value::Object(meta)) = value.get_mut("metadata") {
        for field in ["resourceVersion", "uid", "creationTimestamp", "deletionTimestamp"] {
            meta.remove(field);
        }
    }
}

/// Recursive merge: maps merge key by key, everything else is replaced
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// `key=value` or bare `key` requirements, comma separated
fn parse_selector(selector: &str) -> Vec<(String, Option<String>)> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|requirement| match requirement.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (requirement.to_string(), None),
        })
        .collect()
}

fn matches_selector(obj: &DynamicObject, requirements: &[(String, Option<String>)]) -> bool {
    let labels = obj.metadata.labels.as_ref();
    requirements.iter().all(|(key, value)| {
        match (labels.and_then(|l| l.get(key)), value) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterEngineSpec;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn deployment(name: &str, replicas: u32) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": "engine-ns",
                "labels": {"app": name}
            },
            "spec": {"replicas": replicas}
        }))
        .unwrap()
    }

    fn deployment_ref(name: &str) -> ResourceRef {
        ResourceRef::namespaced("apps/v1", "Deployment", "engine-ns", name)
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = InMemoryStore::new();
        let first = store.apply(&deployment("a", 1), "test").await.unwrap();
        let second = store.apply(&deployment("a", 1), "test").await.unwrap();

        assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
        assert_eq!(store.journal(), vec![StoreOp::Created(deployment_ref("a"))]);
    }

    #[tokio::test]
    async fn test_apply_merges_changed_fields() {
        let store = InMemoryStore::new();
        store.apply(&deployment("a", 1), "test").await.unwrap();
        store
            .set_status(&deployment_ref("a"), json!({"readyReplicas": 1}))
            .await
            .unwrap();

        let updated = store.apply(&deployment("a", 3), "test").await.unwrap();
        assert_eq!(updated.data["spec"]["replicas"], 3);
        // Fields outside the applied document are left alone
        assert_eq!(updated.data["status"]["readyReplicas"], 1);
    }

    #[tokio::test]
    async fn test_create_rejects_existing() {
        let store = InMemoryStore::new();
        store.create(&deployment("a", 1)).await.unwrap();
        assert_matches!(
            store.create(&deployment("a", 1)).await,
            Err(Error::AlreadyExists { .. })
        );
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_leaves_object_terminating() {
        let store = InMemoryStore::new();
        store.insert(deployment("a", 1)).await.unwrap();
        store.add_finalizer(&deployment_ref("a"), "example.com/cleanup").await.unwrap();

        store.delete(&deployment_ref("a")).await.unwrap();
        let held = store.get(&deployment_ref("a")).await.unwrap().unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());

        store.clear_finalizers(&deployment_ref("a")).await.unwrap();
        assert!(!store.contains(&deployment_ref("a")).await);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = InMemoryStore::new();
        assert_matches!(
            store.delete(&deployment_ref("missing")).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_list_with_selector() {
        let store = InMemoryStore::new();
        store.insert(deployment("a", 1)).await.unwrap();
        store.insert(deployment("b", 1)).await.unwrap();

        let all = store.list("apps/v1", "Deployment", Some("engine-ns"), None).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_a = store
            .list("apps/v1", "Deployment", None, Some("app=a"))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_engine_optimistic_concurrency() {
        let store = InMemoryStore::new();
        let engine = store
            .insert_engine(ClusterEngine::new("engine", ClusterEngineSpec::default()))
            .await
            .unwrap();

        let mut stale = engine.clone();
        store.touch(&engine_ref("engine")).await.unwrap();

        stale.spec.target_namespace = "engine-ns".to_string();
        assert_matches!(store.replace_engine(&stale).await, Err(Error::Conflict { .. }));
        assert_matches!(store.replace_engine_status(&stale).await, Err(Error::Conflict { .. }));

        let fresh = store.get_engine("engine").await.unwrap().unwrap();
        let mut changed = fresh.clone();
        changed.spec.target_namespace = "engine-ns".to_string();
        let written = store.replace_engine(&changed).await.unwrap();
        assert_eq!(written.spec.target_namespace, "engine-ns");
        assert_ne!(written.metadata.resource_version, fresh.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = InMemoryStore::new();
        store.fail_writes_to(deployment_ref("a"), "denied");
        assert_matches!(store.apply(&deployment("a", 1), "test").await, Err(Error::Store(_)));

        store.fail_reads_of(deployment_ref("a"), "unavailable");
        assert_matches!(store.get(&deployment_ref("a")).await, Err(Error::Store(_)));

        store.clear_faults();
        assert!(store.get(&deployment_ref("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_status_conflicts() {
        let store = InMemoryStore::new();
        let engine = store
            .insert_engine(ClusterEngine::new("engine", ClusterEngineSpec::default()))
            .await
            .unwrap();

        store.conflict_status_writes(1);
        assert_matches!(store.replace_engine_status(&engine).await, Err(Error::Conflict { .. }));
        assert!(store.replace_engine_status(&engine).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_api() {
        let store = InMemoryStore::new();
        let (api_version, kind) = ("addon.open-cluster-management.io/v1alpha1", "ClusterManagementAddOn");
        assert!(store.api_installed(api_version, kind).await.unwrap());

        store.remove_api(api_version, kind);
        assert!(!store.api_installed(api_version, kind).await.unwrap());
        assert!(store.api_installed("apps/v1", "Deployment").await.unwrap());

        store.restore_api(api_version, kind);
        assert!(store.api_installed(api_version, kind).await.unwrap());
    }
}
