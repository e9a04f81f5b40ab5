//! Shared controller helpers.
//!
//! Finalizer bookkeeping and the create-or-replace flow used for every
//! child object the controllers own.

use std::collections::BTreeSet;

use kube::ResourceExt;
use tracing::{debug, info};

use super::cluster::{ClusterClient, ClusterObject, ListFilter};
use super::error::Result;
use crate::resources::common::spec_hash_of;

/// Add a finalizer to a resource if missing. Returns whether it was added.
pub async fn ensure_finalizer<C, K>(cluster: &C, obj: &K, finalizer: &str) -> Result<bool>
where
    C: ClusterClient,
    K: ClusterObject,
{
    let mut finalizers = obj.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    finalizers.push(finalizer.to_string());
    cluster
        .set_finalizers::<K>(
            &obj.namespace().unwrap_or_default(),
            &obj.name_any(),
            &finalizers,
        )
        .await?;
    Ok(true)
}

/// Remove a specific finalizer from a resource.
pub async fn remove_finalizer<C, K>(cluster: &C, obj: &K, finalizer: &str) -> Result<()>
where
    C: ClusterClient,
    K: ClusterObject,
{
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    if finalizers.len() == obj.finalizers().len() {
        return Ok(());
    }
    cluster
        .set_finalizers::<K>(
            &obj.namespace().unwrap_or_default(),
            &obj.name_any(),
            &finalizers,
        )
        .await
}

/// Copy server-assigned identity fields from the live object.
pub fn preserve_identity<K: ClusterObject>(desired: &mut K, current: &K) {
    let current = current.meta();
    let meta = desired.meta_mut();
    meta.uid = current.uid.clone();
    meta.resource_version = current.resource_version.clone();
    meta.creation_timestamp = current.creation_timestamp.clone();
}

/// What [`upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Replaced,
    Unchanged,
}

/// Create the object, or replace it when its hash annotation differs.
///
/// `adjust` runs on the desired object before a replace and may copy fields
/// owned by other controllers from the live object.
pub async fn upsert<C, K, F>(cluster: &C, mut desired: K, adjust: F) -> Result<(UpsertAction, K)>
where
    C: ClusterClient,
    K: ClusterObject,
    F: FnOnce(&mut K, &K),
{
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    let Some(current) = cluster.get::<K>(&namespace, &name).await? else {
        let created = cluster.create(&desired).await?;
        info!(kind = %K::kind(&()), name = %name, "Created");
        return Ok((UpsertAction::Created, created));
    };
    if spec_hash_of(&current).is_some() && spec_hash_of(&current) == spec_hash_of(&desired) {
        debug!(kind = %K::kind(&()), name = %name, "Up to date");
        return Ok((UpsertAction::Unchanged, current));
    }
    adjust(&mut desired, &current);
    preserve_identity(&mut desired, &current);
    let replaced = cluster.replace(&desired).await?;
    info!(kind = %K::kind(&()), name = %name, "Updated");
    Ok((UpsertAction::Replaced, replaced))
}

/// Delete listed objects whose names are not in `keep`. Returns the deleted names.
pub async fn prune<C, K>(
    cluster: &C,
    namespace: &str,
    filter: &ListFilter,
    keep: &BTreeSet<String>,
) -> Result<Vec<String>>
where
    C: ClusterClient,
    K: ClusterObject,
{
    let mut deleted = Vec::new();
    for obj in cluster.list::<K>(namespace, filter).await? {
        let name = obj.name_any();
        if keep.contains(&name) {
            continue;
        }
        cluster.delete::<K>(namespace, &name).await?;
        info!(kind = %K::kind(&()), name = %name, "Deleted outdated object");
        deleted.push(name);
    }
    Ok(deleted)
}
