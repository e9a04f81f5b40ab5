//! Cluster access seam.
//!
//! Sub-reconcilers talk to the API server only through [`ClusterClient`].
//! [`KubeCluster`] is backed by `kube::Api`; [`InMemoryCluster`] is a
//! deterministic store that lets reconcile passes run without a cluster and
//! counts the mutating calls they make.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use jiff::{SignedDuration, Timestamp};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::{Error, Result};

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "bkapp-operator";

/// Namespaced objects the controller reads and writes.
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Owner-index lookup: label equality plus an optional owner uid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub labels: BTreeMap<String, String>,
    pub owner_uid: Option<String>,
}

impl ListFilter {
    pub fn labels(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            owner_uid: None,
        }
    }

    /// Restrict to objects with an owner reference to `uid`.
    pub fn owned_by(mut self, uid: Option<String>) -> Self {
        self.owner_uid = uid;
        self
    }

    /// Label selector string, e.g. `a=b,c=d`.
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether an object's metadata passes the filter.
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        let labels_match = self.labels.iter().all(|(k, v)| {
            meta.labels
                .as_ref()
                .and_then(|l| l.get(k))
                .is_some_and(|actual| actual == v)
        });
        let owner_match = match &self.owner_uid {
            None => true,
            Some(uid) => meta
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|r| &r.uid == uid)),
        };
        labels_match && owner_match
    }
}

/// Severity of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// A Kubernetes event about an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: EventKind,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl ClusterEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<Option<String>>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<Option<String>>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }
}

/// Cluster operations used by the reconcilers.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Current time as seen by the reconcilers.
    fn now(&self) -> Timestamp;

    /// Fetch an object, `None` if it does not exist.
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects of a namespace passing the filter.
    async fn list<K: ClusterObject>(&self, namespace: &str, filter: &ListFilter) -> Result<Vec<K>>;

    /// Create an object; `AlreadyExists` if the name is taken.
    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K>;

    /// Replace an object. Identity fields of `obj` must come from the live object.
    async fn replace<K: ClusterObject>(&self, obj: &K) -> Result<K>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Apply a JSON merge patch (`{"status": ...}`) to the status subresource.
    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()>;

    /// Overwrite the finalizer list of an object.
    async fn set_finalizers<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;

    /// Publish an event about `obj`. Failures are logged, never returned.
    async fn publish_event<K: ClusterObject>(&self, obj: &K, event: ClusterEvent);
}

/// [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    reporter: Reporter,
}

impl Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("reporter", &self.reporter)
            .finish_non_exhaustive()
    }
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: ClusterObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// API object time as a [`Timestamp`]. Sub-second precision is dropped.
pub fn timestamp_of(time: &Time) -> Option<Timestamp> {
    Timestamp::from_second(time.0.timestamp()).ok()
}

/// [`Timestamp`] as an API object time.
pub fn k8s_time(ts: Timestamp) -> Option<Time> {
    let nanos = u32::try_from(ts.subsec_nanosecond()).ok()?;
    k8s_openapi::chrono::DateTime::from_timestamp(ts.as_second(), nanos).map(Time)
}

fn object_name<K: Resource>(obj: &K) -> (String, String) {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

fn not_found<K: ClusterObject>(name: &str) -> Error {
    Error::NotFound {
        kind: K::kind(&()).to_string(),
        name: name.to_string(),
    }
}

fn already_exists<K: ClusterObject>(name: &str) -> Error {
    Error::AlreadyExists {
        kind: K::kind(&()).to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: ClusterObject>(&self, namespace: &str, filter: &ListFilter) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !filter.labels.is_empty() {
            params = params.labels(&filter.label_selector());
        }
        let items = self.api::<K>(namespace).list(&params).await?.items;
        Ok(items
            .into_iter()
            .filter(|obj| filter.matches(obj.meta()))
            .collect())
    }

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_name(obj);
        match self.api::<K>(&namespace).create(&Self::post_params(), obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(already_exists::<K>(&name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_name(obj);
        match self
            .api::<K>(&namespace)
            .replace(&name, &Self::post_params(), obj)
            .await
        {
            Ok(replaced) => Ok(replaced),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(not_found::<K>(&name)),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::Transient(format!(
                "conflict updating {} {name}",
                K::kind(&())
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(kind = %K::kind(&()), name = %name, "Object already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        self.api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn set_finalizers<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        match self
            .api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_event<K: ClusterObject>(&self, obj: &K, event: ClusterEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let object_ref = obj.object_ref(&());
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note,
                    action: event.action,
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}

/// An event captured by [`InMemoryCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: String,
    pub name: String,
    pub event: ClusterEvent,
}

type ObjectKey = (String, String, String);

#[derive(Debug)]
struct MemState {
    objects: BTreeMap<ObjectKey, Value>,
    next_uid: u64,
    next_resource_version: u64,
    mutations: usize,
    events: Vec<RecordedEvent>,
    clock: Timestamp,
}

/// In-process [`ClusterClient`] with API-server-like semantics for the
/// operations the reconcilers use.
///
/// Every create, replace, delete, status patch and finalizer update counts
/// as one mutation. Helpers prefixed with `set_` simulate changes made by
/// other cluster components and are not counted.
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<MemState>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                objects: BTreeMap::new(),
                next_uid: 1,
                next_resource_version: 1,
                mutations: 0,
                events: Vec::new(),
                clock: Timestamp::from_second(Timestamp::now().as_second())
                    .unwrap_or(Timestamp::UNIX_EPOCH),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key<K: ClusterObject>(namespace: &str, name: &str) -> ObjectKey {
        (
            K::kind(&()).to_string(),
            namespace.to_string(),
            name.to_string(),
        )
    }

    /// Store an object as if it had been created by another client.
    pub fn insert<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let mut state = self.lock();
        let stored = Self::admit(&mut state, obj)?;
        Ok(stored)
    }

    fn admit<K: ClusterObject>(state: &mut MemState, obj: &K) -> Result<K> {
        let (namespace, name) = object_name(obj);
        let key = Self::key::<K>(&namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(already_exists::<K>(&name));
        }
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.uid = Some(format!("uid-{}", state.next_uid));
        state.next_uid += 1;
        meta.resource_version = Some(state.next_resource_version.to_string());
        state.next_resource_version += 1;
        meta.generation = Some(1);
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = k8s_time(state.clock);
        }
        let value = serde_json::to_value(&obj)?;
        let stored: K = serde_json::from_value(value.clone())?;
        state.objects.insert(key, value);
        Ok(stored)
    }

    /// Number of mutating calls made through the [`ClusterClient`] interface.
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().events.clone()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        let secs = i64::try_from(by.as_secs()).unwrap_or(i64::MAX);
        if let Ok(next) = state.clock.checked_add(SignedDuration::from_secs(secs)) {
            state.clock = next;
        }
    }

    /// Read an object without going through the trait.
    pub fn peek<K: ClusterObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.lock();
        state
            .objects
            .get(&Self::key::<K>(namespace, name))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Names of all stored objects of a kind in a namespace.
    pub fn names<K: ClusterObject>(&self, namespace: &str) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        self.lock()
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    fn edit(&self, key: &ObjectKey, f: impl FnOnce(&mut Value, Timestamp)) -> bool {
        let mut state = self.lock();
        let clock = state.clock;
        match state.objects.get_mut(key) {
            Some(value) => {
                f(value, clock);
                true
            }
            None => false,
        }
    }

    /// Simulate the kubelet moving a pod to `phase`. Terminal phases record
    /// the container's finish time.
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) -> bool {
        use k8s_openapi::api::core::v1::Pod;
        let key = Self::key::<Pod>(namespace, name);
        let phase = phase.to_string();
        self.edit(&key, move |value, clock| {
            let mut status = serde_json::json!({
                "phase": phase,
                "startTime": value.pointer("/metadata/creationTimestamp").cloned().unwrap_or(Value::Null),
            });
            if phase == "Succeeded" || phase == "Failed" {
                let exit_code = if phase == "Succeeded" { 0 } else { 1 };
                status["containerStatuses"] = serde_json::json!([{
                    "name": "hook",
                    "image": "",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": {"terminated": {
                        "exitCode": exit_code,
                        "finishedAt": clock.to_string(),
                    }},
                }]);
            }
            value["status"] = status;
        })
    }

    /// Simulate the deployment controller finishing a rollout.
    pub fn set_deployment_available(&self, namespace: &str, name: &str) -> bool {
        use k8s_openapi::api::apps::v1::Deployment;
        let key = Self::key::<Deployment>(namespace, name);
        self.edit(&key, |value, _| {
            let replicas = value
                .pointer("/spec/replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let generation = value
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            value["status"] = serde_json::json!({
                "observedGeneration": generation,
                "replicas": replicas,
                "updatedReplicas": replicas,
                "readyReplicas": replicas,
                "availableReplicas": replicas,
                "conditions": [
                    {"type": "Available", "status": "True", "reason": "MinimumReplicasAvailable"},
                    {"type": "Progressing", "status": "True", "reason": "NewReplicaSetAvailable"}
                ],
            });
        })
    }

    /// Replace the status of any object.
    pub fn set_status<K: ClusterObject>(&self, namespace: &str, name: &str, status: Value) -> bool {
        let key = Self::key::<K>(namespace, name);
        self.edit(&key, |value, _| value["status"] = status)
    }

    /// Start deleting an object the way `kubectl delete` would.
    pub fn mark_deleted<K: ClusterObject>(&self, namespace: &str, name: &str) -> bool {
        let key = Self::key::<K>(namespace, name);
        let mut state = self.lock();
        let clock = state.clock;
        let has_finalizers = match state.objects.get_mut(&key) {
            Some(value) => {
                value["metadata"]["deletionTimestamp"] = Value::String(clock.to_string());
                value
                    .pointer("/metadata/finalizers")
                    .and_then(Value::as_array)
                    .is_some_and(|f| !f.is_empty())
            }
            None => return false,
        };
        if !has_finalizers {
            state.objects.remove(&key);
        }
        true
    }
}

/// Apply an RFC 7386 JSON merge patch.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        apply_merge_patch(
                            target_map.entry(key.clone()).or_insert(Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    fn now(&self) -> Timestamp {
        self.lock().clock
    }

    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let state = self.lock();
        match state.objects.get(&Self::key::<K>(namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: ClusterObject>(&self, namespace: &str, filter: &ListFilter) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let state = self.lock();
        let mut items = Vec::new();
        for ((k, ns, _), value) in &state.objects {
            if *k != kind || ns != namespace {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if filter.matches(obj.meta()) {
                items.push(obj);
            }
        }
        Ok(items)
    }

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let mut state = self.lock();
        let created = Self::admit(&mut state, obj)?;
        state.mutations += 1;
        Ok(created)
    }

    async fn replace<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_name(obj);
        let key = Self::key::<K>(&namespace, &name);
        let mut state = self.lock();
        let rv = state.next_resource_version;
        let Some(stored) = state.objects.get(&key) else {
            return Err(not_found::<K>(&name));
        };
        let current: K = serde_json::from_value(stored.clone())?;
        let current_meta = current.meta();
        if let Some(sent) = &obj.meta().resource_version
            && current_meta.resource_version.as_ref() != Some(sent)
        {
            return Err(Error::Transient(format!(
                "conflict updating {} {name}",
                K::kind(&())
            )));
        }

        let mut next = obj.clone();
        let spec_changed = {
            let old_spec = stored.get("spec");
            let new_value = serde_json::to_value(&next)?;
            old_spec != new_value.get("spec")
        };
        let status = stored.get("status").cloned();
        let meta = next.meta_mut();
        meta.uid = current_meta.uid.clone();
        meta.creation_timestamp = current_meta.creation_timestamp.clone();
        meta.deletion_timestamp = current_meta.deletion_timestamp.clone();
        meta.resource_version = Some(rv.to_string());
        let generation = current_meta.generation.unwrap_or(1);
        meta.generation = Some(if spec_changed {
            generation + 1
        } else {
            generation
        });

        let mut value = serde_json::to_value(&next)?;
        match status {
            Some(status) => value["status"] = status,
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        let replaced: K = serde_json::from_value(value.clone())?;
        state.objects.insert(key, value);
        state.next_resource_version += 1;
        state.mutations += 1;
        Ok(replaced)
    }

    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = Self::key::<K>(namespace, name);
        let mut state = self.lock();
        let clock = state.clock;
        let Some(value) = state.objects.get_mut(&key) else {
            return Ok(());
        };
        let has_finalizers = value
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if value.pointer("/metadata/deletionTimestamp").is_none() {
                value["metadata"]["deletionTimestamp"] = Value::String(clock.to_string());
            }
        } else {
            state.objects.remove(&key);
        }
        state.mutations += 1;
        Ok(())
    }

    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let key = Self::key::<K>(namespace, name);
        let mut state = self.lock();
        let rv = state.next_resource_version;
        let Some(value) = state.objects.get_mut(&key) else {
            return Err(not_found::<K>(name));
        };
        if let Some(status_patch) = patch.get("status") {
            let mut status = value.get("status").cloned().unwrap_or(Value::Null);
            apply_merge_patch(&mut status, status_patch);
            value["status"] = status;
        }
        value["metadata"]["resourceVersion"] = Value::String(rv.to_string());
        state.next_resource_version += 1;
        state.mutations += 1;
        Ok(())
    }

    async fn set_finalizers<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let key = Self::key::<K>(namespace, name);
        let mut state = self.lock();
        let rv = state.next_resource_version;
        let Some(value) = state.objects.get_mut(&key) else {
            return Ok(());
        };
        let deleting = value.pointer("/metadata/deletionTimestamp").is_some();
        if finalizers.is_empty() {
            if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.remove("finalizers");
            }
        } else {
            value["metadata"]["finalizers"] = serde_json::to_value(finalizers)?;
        }
        value["metadata"]["resourceVersion"] = Value::String(rv.to_string());
        if deleting && finalizers.is_empty() {
            state.objects.remove(&key);
        }
        state.next_resource_version += 1;
        state.mutations += 1;
        Ok(())
    }

    async fn publish_event<K: ClusterObject>(&self, obj: &K, event: ClusterEvent) {
        self.lock().events.push(RecordedEvent {
            kind: K::kind(&()).to_string(),
            name: obj.meta().name.clone().unwrap_or_default(),
            event,
        });
    }
}
