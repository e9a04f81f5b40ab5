//! Process Deployment reconciliation and availability reporting.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use super::cluster::{ClusterClient, ListFilter};
use super::common::{prune, upsert};
use super::error::Result;
use super::outcome::{Outcome, ReconcileState, SubReconciler};
use crate::config::OperatorConfig;
use crate::crd::{AppPhase, BkApp, ConditionStatus, ConditionType};
use crate::envs;
use crate::resources::common::{RESOURCE_TYPE_LABEL, RESOURCE_TYPE_PROCESS, app_selector};
use crate::resources::process::build_deployment;

/// Condition reason reported when a rollout stalls.
pub const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// Owner-index filter for the process workloads of an app.
pub fn owned_process_filter(app: &BkApp) -> ListFilter {
    let mut labels = app_selector(app);
    labels.insert(
        RESOURCE_TYPE_LABEL.to_string(),
        RESOURCE_TYPE_PROCESS.to_string(),
    );
    ListFilter::labels(labels).owned_by(app.uid())
}

/// Rollout state of one Deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    Available,
    Progressing,
    Stalled,
}

pub fn rollout_state(deployment: &Deployment) -> RolloutState {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(envs::DEFAULT_REPLICAS);
    let Some(status) = deployment.status.as_ref() else {
        return RolloutState::Progressing;
    };
    let stalled = status.conditions.iter().flatten().any(|c| {
        c.type_ == "Progressing"
            && c.status == "False"
            && c.reason.as_deref() == Some(PROGRESS_DEADLINE_EXCEEDED)
    });
    if stalled {
        return RolloutState::Stalled;
    }
    let observed = status.observed_generation >= deployment.metadata.generation;
    let updated = status.updated_replicas.unwrap_or(0) >= desired;
    let available = status.available_replicas.unwrap_or(0) >= desired;
    if observed && updated && available {
        RolloutState::Available
    } else {
        RolloutState::Progressing
    }
}

/// Creates, updates and deletes the Deployments of an app's processes.
#[derive(Debug, Clone)]
pub struct ProcessReconciler {
    config: Arc<OperatorConfig>,
}

impl ProcessReconciler {
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        Self { config }
    }

    async fn run<C: ClusterClient>(&self, cluster: &C, state: &mut ReconcileState) -> Result<Outcome> {
        let app = state.app.clone();
        let env = app.environment();
        let namespace = state.namespace();

        let mut current = Vec::with_capacity(app.spec.processes.len());
        for process in &app.spec.processes {
            let desired = build_deployment(&app, &process.name, &self.config)?;
            let autoscaled = self.config.autoscaling_enabled
                && envs::autoscaling(&app, &process.name, env).is_some();
            let (_, deployment) = upsert(cluster, desired, |desired, live| {
                // The HPA owns the replica count of autoscaled processes.
                if autoscaled
                    && let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref())
                {
                    spec.replicas = live_spec.replicas;
                }
            })
            .await?;
            current.push(deployment);
        }

        let keep: BTreeSet<String> = current.iter().map(ResourceExt::name_any).collect();
        prune::<_, Deployment>(cluster, &namespace, &owned_process_filter(&app), &keep).await?;

        report_availability(state, &current);
        Ok(Outcome::Continue)
    }
}

/// Derive AppAvailable, AppProgressing and the phase from the Deployments.
pub fn report_availability(state: &mut ReconcileState, deployments: &[Deployment]) {
    let states: Vec<(String, RolloutState)> = deployments
        .iter()
        .map(|d| (d.name_any(), rollout_state(d)))
        .collect();
    let total = states.len();
    let available = states
        .iter()
        .filter(|(_, s)| *s == RolloutState::Available)
        .count();

    if let Some((name, _)) = states.iter().find(|(_, s)| *s == RolloutState::Stalled) {
        let message = format!("deployment {name} exceeded its progress deadline");
        state.set_condition(
            ConditionType::AppAvailable,
            ConditionStatus::False,
            PROGRESS_DEADLINE_EXCEEDED,
            &message,
        );
        state.set_condition(
            ConditionType::AppProgressing,
            ConditionStatus::False,
            PROGRESS_DEADLINE_EXCEEDED,
            &message,
        );
        state.set_phase(AppPhase::Failed);
    } else if available == total {
        state.set_condition(ConditionType::AppAvailable, ConditionStatus::True, "AppAvailable", "");
        state.set_condition(ConditionType::AppProgressing, ConditionStatus::False, "Finished", "");
        state.set_phase(AppPhase::Running);
    } else {
        let message = format!("{available}/{total} processes available");
        state.set_condition(ConditionType::AppAvailable, ConditionStatus::False, "Progressing", &message);
        state.set_condition(ConditionType::AppProgressing, ConditionStatus::True, "Progressing", &message);
        state.set_phase(AppPhase::Pending);
    }
}

#[async_trait]
impl<C: ClusterClient> SubReconciler<C> for ProcessReconciler {
    fn name(&self) -> &'static str {
        "processes"
    }

    async fn reconcile(&self, cluster: &C, state: &mut ReconcileState) -> Outcome {
        self.run(cluster, state).await.unwrap_or_else(Outcome::Failed)
    }
}
