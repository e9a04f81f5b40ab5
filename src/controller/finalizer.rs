//! Cleanup on BkApp deletion.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use tracing::info;

use super::cluster::{ClusterClient, ClusterEvent, ListFilter};
use super::common::remove_finalizer;
use super::error::{BLOCKING_REQUEUE, Result};
use super::hooks::list_hook_instances;
use super::outcome::{Outcome, ReconcileState, SubReconciler};
use crate::resources::common::app_selector;

/// Finalizer guarding hook pod and Service cleanup.
pub const FINALIZER: &str = "bkapp.paas.bk.tencent.com/finalizer";

#[derive(Debug, Clone, Copy, Default)]
pub struct FinalizerReconciler;

impl FinalizerReconciler {
    async fn run<C: ClusterClient>(&self, cluster: &C, state: &mut ReconcileState) -> Result<Outcome> {
        if !state.app.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(Outcome::End);
        }
        let namespace = state.namespace();
        let hooks = list_hook_instances(cluster, &state.app).await?;
        if let Some(running) = hooks.iter().find(|h| h.is_running_within_timeout(state.now)) {
            info!(app = %state.name(), pod = %running.pod.name_any(), "Waiting for hook pod before finalizing");
            return Ok(Outcome::RequeueAfter(BLOCKING_REQUEUE));
        }

        for hook in &hooks {
            cluster.delete::<Pod>(&namespace, &hook.pod.name_any()).await?;
        }
        let filter = ListFilter::labels(app_selector(&state.app)).owned_by(state.app.uid());
        for service in cluster.list::<Service>(&namespace, &filter).await? {
            cluster.delete::<Service>(&namespace, &service.name_any()).await?;
        }

        cluster
            .publish_event(
                &state.app,
                ClusterEvent::normal("Finalized", "Delete", format!("cleaned up {} hook pods", hooks.len())),
            )
            .await;
        remove_finalizer(cluster, &state.app, FINALIZER).await?;
        info!(app = %state.name(), "Finalized");
        Ok(Outcome::End)
    }
}

#[async_trait]
impl<C: ClusterClient> SubReconciler<C> for FinalizerReconciler {
    fn name(&self) -> &'static str {
        "finalizer"
    }

    async fn reconcile(&self, cluster: &C, state: &mut ReconcileState) -> Outcome {
        self.run(cluster, state).await.unwrap_or_else(Outcome::Failed)
    }
}
