//! Common resource generation utilities.
//!
//! Provides functions for creating standard Kubernetes resources with proper
//! labels, owner references, and drift-detection annotations.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::controller::error::Result;
use crate::crd::BkApp;

/// Label carrying the owning app's name.
pub const APP_NAME_LABEL: &str = "bkapp.paas.bk.tencent.com/name";
/// Label carrying the process name.
pub const PROCESS_NAME_LABEL: &str = "bkapp.paas.bk.tencent.com/process-name";
/// Label distinguishing process workloads from hook pods.
pub const RESOURCE_TYPE_LABEL: &str = "bkapp.paas.bk.tencent.com/resource-type";
/// Label carrying the hook type of a hook pod.
pub const HOOK_TYPE_LABEL: &str = "bkapp.paas.bk.tencent.com/hook-type";
/// Label carrying the DomainGroupMapping source type of an Ingress.
pub const SOURCE_TYPE_LABEL: &str = "bkapp.paas.bk.tencent.com/source-type";
/// Standard managed-by label.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of the managed-by label.
pub const MANAGER_NAME: &str = "bkapp-operator";

/// Status-stripped JSON snapshot of the owning BkApp.
pub const SNAPSHOT_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/bkapp-snapshot";
/// sha256 of the desired object, used to skip no-op updates.
pub const SPEC_HASH_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/spec-hash";

/// Resource type of process workloads.
pub const RESOURCE_TYPE_PROCESS: &str = "process";
/// Resource type of hook pods.
pub const RESOURCE_TYPE_HOOK: &str = "hook";

/// Standard labels applied to all resources managed for an app
pub fn standard_labels(app: &BkApp) -> BTreeMap<String, String> {
    let mut labels = app.platform_labels();
    labels.insert(APP_NAME_LABEL.to_string(), app.name_any());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    labels
}

/// Labels selecting the pods of one process
pub fn selector_labels(app: &BkApp, process: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_NAME_LABEL.to_string(), app.name_any());
    labels.insert(PROCESS_NAME_LABEL.to_string(), process.to_string());
    labels
}

/// Labels of a process workload and its pods
pub fn process_labels(app: &BkApp, process: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(app);
    labels.extend(selector_labels(app, process));
    labels.insert(
        RESOURCE_TYPE_LABEL.to_string(),
        RESOURCE_TYPE_PROCESS.to_string(),
    );
    labels
}

/// Labels identifying the children of an app, for owner-index lookups
pub fn app_selector(app: &BkApp) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_NAME_LABEL.to_string(), app.name_any());
    labels
}

/// Create a controller owner reference pointing at `owner`
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.meta().name.clone().unwrap_or_default(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Lowercase a value and replace characters not allowed in object names.
pub fn dns_safe(raw: &str) -> String {
    let mut out: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.ends_with('-') || out.ends_with('.') {
        out.pop();
    }
    out
}

/// Name of the Deployment, Service and HPA of a process
pub fn process_resource_name(app: &BkApp, process: &str) -> String {
    format!("{}--{}", app.name_any(), dns_safe(process))
}

/// sha256 of the serialized object, hex encoded.
pub fn spec_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Stamp the object's hash annotation. Must be called after the object is
/// otherwise complete.
pub fn stamp_spec_hash<K>(obj: &mut K) -> Result<()>
where
    K: Resource + Serialize,
{
    let hash = spec_hash(obj)?;
    obj.meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNO_KEY.to_string(), hash);
    Ok(())
}

/// Hash annotation of an object, if stamped.
pub fn spec_hash_of<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNO_KEY))
        .map(String::as_str)
}

/// JSON snapshot of the app without its status or server-managed metadata.
pub fn app_snapshot(app: &BkApp) -> Result<String> {
    let snapshot = serde_json::json!({
        "apiVersion": BkApp::api_version(&()),
        "kind": BkApp::kind(&()),
        "metadata": {
            "name": app.metadata.name,
            "namespace": app.metadata.namespace,
            "labels": app.metadata.labels,
            "annotations": app.metadata.annotations,
        },
        "spec": app.spec,
    });
    Ok(serde_json::to_string(&snapshot)?)
}
