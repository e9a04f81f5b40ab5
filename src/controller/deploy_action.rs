//! Deploy action detection.
//!
//! A new deploy is requested by changing the `deploy-id` annotation (or, when
//! absent, the generation). Its first pass resets the status so every later
//! step reports on the new deploy only.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use super::cluster::{ClusterClient, ClusterEvent};
use super::error::{Error, Result};
use super::hooks::HookInstance;
use super::outcome::{Outcome, ReconcileState, SubReconciler};
use super::status::reset_conditions;
use crate::crd::{AppPhase, HookType};
use crate::resources::hook::hook_pod_name;

/// Condition reason used when a new deploy resets the status.
pub const NEW_DEPLOYMENT_REASON: &str = "NewDeployment";

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployActionReconciler;

impl DeployActionReconciler {
    async fn run<C: ClusterClient>(&self, cluster: &C, state: &mut ReconcileState) -> Result<Outcome> {
        let desired = state.app.desired_deploy_id();
        let previous = state.status().deploy_id.clone();
        if desired == previous {
            return Ok(Outcome::Continue);
        }

        if state.app.pre_release_hook().is_some()
            && !previous.is_empty()
            && !state.app.is_deploy_interrupted(&previous)
        {
            let pod_name = hook_pod_name(&state.app, HookType::PreRelease, &previous);
            if let Some(pod) = cluster.get::<Pod>(&state.namespace(), &pod_name).await?
                && HookInstance::from_pod(pod).is_running_within_timeout(state.now)
            {
                return Err(Error::LastHookStillRunning(previous));
            }
        }

        let generation = state.generation();
        let status = state.status_mut();
        status.phase = AppPhase::Pending;
        status.deploy_id = desired.clone();
        status.conditions = reset_conditions(NEW_DEPLOYMENT_REASON, "", generation);
        status.hook_statuses.clear();
        state.persist(cluster).await?;

        info!(app = %state.name(), previous = %previous, deploy_id = %desired, "New deploy action detected");
        cluster
            .publish_event(
                &state.app,
                ClusterEvent::normal(
                    "DeployActionDetected",
                    "Deploy",
                    format!("deploy {desired} started"),
                ),
            )
            .await;
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl<C: ClusterClient> SubReconciler<C> for DeployActionReconciler {
    fn name(&self) -> &'static str {
        "deploy-action"
    }

    async fn reconcile(&self, cluster: &C, state: &mut ReconcileState) -> Outcome {
        self.run(cluster, state).await.unwrap_or_else(Outcome::Failed)
    }
}
