//! DomainGroupMapping reconciler.
//!
//! Syncs the Ingress objects of a mapping with the domains it declares and
//! the entrance its BkApp exposes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, warn};

use super::cluster::{ClusterClient, ListFilter};
use super::common::{prune, upsert};
use super::context::{Context, retry_key};
use super::error::{Error, Result};
use super::status::merge_patch_diff;
use crate::config::OperatorConfig;
use crate::crd::{BkApp, DomainGroupMapping, DomainGroupMappingStatus};
use crate::resources::common::app_selector;
use crate::resources::ingress::build_ingresses;

/// Requeue interval of a synced mapping.
pub const SYNCED_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue interval while the referenced BkApp is missing.
pub const MISSING_APP_REQUEUE: Duration = Duration::from_secs(30);

const KIND: &str = "DomainGroupMapping";

/// Reconcile a DomainGroupMapping (controller entry point).
pub async fn reconcile(obj: Arc<DomainGroupMapping>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling DomainGroupMapping");

    let timeout = ctx.config.reconcile_timeout();
    let result = match tokio::time::timeout(
        timeout,
        reconcile_mapping(&ctx.cluster, &ctx.config, &obj),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    };
    ctx.record_reconcile(
        KIND,
        &namespace,
        &name,
        start.elapsed().as_secs_f64(),
        result.is_ok(),
    );
    result
}

/// Error policy for the DomainGroupMapping controller.
pub fn error_policy(obj: Arc<DomainGroupMapping>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    ctx.record_failure(KIND, error.category());

    if error.is_not_found() {
        debug!(name = %name, "DomainGroupMapping not found (likely deleted)");
        ctx.forget(KIND, &namespace, &name);
        return Action::await_change();
    }
    if error.is_validation() {
        warn!(name = %name, error = %error, "Waiting for a change before retrying");
        return Action::await_change();
    }
    let delay = ctx.retry.next_delay(&retry_key(KIND, &namespace, &name));
    error!(name = %name, error = %error, ?delay, "Reconcile failed, will retry");
    Action::requeue(delay)
}

/// Sync the Ingresses of one mapping.
pub async fn reconcile_mapping<C: ClusterClient>(
    cluster: &C,
    config: &Arc<OperatorConfig>,
    mapping: &DomainGroupMapping,
) -> Result<Action> {
    if mapping.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let namespace = mapping.namespace().unwrap_or_default();
    let app_name = &mapping.spec.reference.name;

    let Some(app) = cluster.get::<BkApp>(&namespace, app_name).await? else {
        info!(mapping = %mapping.name_any(), app = %app_name, "Referenced BkApp not found");
        let status = DomainGroupMappingStatus {
            observed_generation: mapping.metadata.generation,
            ingresses: current_ingresses(mapping),
            message: format!("BkApp {app_name} not found"),
        };
        write_status(cluster, mapping, &status).await?;
        return Ok(Action::requeue(MISSING_APP_REQUEUE));
    };

    let desired = match build_ingresses(mapping, &app, config) {
        Ok(desired) => desired,
        Err(e) if e.is_validation() => {
            let status = DomainGroupMappingStatus {
                observed_generation: mapping.metadata.generation,
                ingresses: current_ingresses(mapping),
                message: e.to_string(),
            };
            write_status(cluster, mapping, &status).await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let keep: BTreeSet<String> = desired.iter().map(ResourceExt::name_any).collect();
    let filter = ListFilter::labels(app_selector(&app)).owned_by(mapping.uid());
    prune::<_, Ingress>(cluster, &namespace, &filter, &keep).await?;
    for ingress in desired {
        upsert(cluster, ingress, |_, _| {}).await?;
    }

    let status = DomainGroupMappingStatus {
        observed_generation: mapping.metadata.generation,
        ingresses: keep.into_iter().collect(),
        message: String::new(),
    };
    write_status(cluster, mapping, &status).await?;
    Ok(Action::requeue(SYNCED_REQUEUE))
}

fn current_ingresses(mapping: &DomainGroupMapping) -> Vec<String> {
    mapping
        .status
        .as_ref()
        .map(|s| s.ingresses.clone())
        .unwrap_or_default()
}

async fn write_status<C: ClusterClient>(
    cluster: &C,
    mapping: &DomainGroupMapping,
    status: &DomainGroupMappingStatus,
) -> Result<()> {
    let old = serde_json::to_value(mapping.status.clone().unwrap_or_default())?;
    let new = serde_json::to_value(status)?;
    let Some(patch) = merge_patch_diff(&old, &new) else {
        return Ok(());
    };
    cluster
        .patch_status::<DomainGroupMapping>(
            &mapping.namespace().unwrap_or_default(),
            &mapping.name_any(),
            &serde_json::json!({ "status": patch }),
        )
        .await
}
