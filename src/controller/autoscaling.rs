//! HorizontalPodAutoscaler reconciliation and health reporting.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::ResourceExt;

use super::cluster::ClusterClient;
use super::common::{prune, upsert};
use super::error::Result;
use super::outcome::{Outcome, ReconcileState, SubReconciler};
use super::processes::owned_process_filter;
use crate::config::OperatorConfig;
use crate::crd::{ConditionStatus, ConditionType};
use crate::resources::autoscaling::desired_hpas;

/// HPA condition types that must not be `False`.
const HEALTH_CONDITIONS: [&str; 2] = ["ScalingActive", "AbleToScale"];

/// Health of an app's autoscalers as `(status, reason, message)`.
pub fn autoscaling_health(
    hpas: &[HorizontalPodAutoscaler],
    globally_enabled: bool,
) -> (ConditionStatus, String, String) {
    if hpas.is_empty() {
        let reason = if globally_enabled { "NotConfigured" } else { "Disabled" };
        return (ConditionStatus::Unknown, reason.to_string(), String::new());
    }

    let failing = hpas.iter().find_map(|hpa| {
        hpa.status
            .as_ref()?
            .conditions
            .iter()
            .flatten()
            .find(|c| HEALTH_CONDITIONS.contains(&c.type_.as_str()) && c.status == "False")
    });
    if let Some(c) = failing {
        return (
            ConditionStatus::False,
            c.reason.clone().unwrap_or_default(),
            c.message.clone().unwrap_or_default(),
        );
    }

    let pending = hpas.iter().any(|hpa| {
        hpa.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_none_or(Vec::is_empty)
    });
    if pending {
        return (
            ConditionStatus::Unknown,
            "Pending".to_string(),
            "autoscaler has not reported yet".to_string(),
        );
    }
    (
        ConditionStatus::True,
        "AutoscalingAvailable".to_string(),
        String::new(),
    )
}

#[derive(Debug, Clone)]
pub struct AutoscalingReconciler {
    config: Arc<OperatorConfig>,
}

impl AutoscalingReconciler {
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        Self { config }
    }

    async fn run<C: ClusterClient>(&self, cluster: &C, state: &mut ReconcileState) -> Result<Outcome> {
        let desired = desired_hpas(&state.app, &self.config)?;
        let keep: BTreeSet<String> = desired.iter().map(ResourceExt::name_any).collect();
        prune::<_, HorizontalPodAutoscaler>(
            cluster,
            &state.namespace(),
            &owned_process_filter(&state.app),
            &keep,
        )
        .await?;

        let mut current = Vec::with_capacity(desired.len());
        for hpa in desired {
            let (_, live) = upsert(cluster, hpa, |_, _| {}).await?;
            current.push(live);
        }

        let (status, reason, message) =
            autoscaling_health(&current, self.config.autoscaling_enabled);
        state.set_condition(ConditionType::AutoscalingAvailable, status, &reason, &message);
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl<C: ClusterClient> SubReconciler<C> for AutoscalingReconciler {
    fn name(&self) -> &'static str {
        "autoscaling"
    }

    async fn reconcile(&self, cluster: &C, state: &mut ReconcileState) -> Outcome {
        self.run(cluster, state).await.unwrap_or_else(Outcome::Failed)
    }
}
