//! Pre-release hook execution.
//!
//! The hook runs as a single pod per deploy. Its name is derived from the
//! deploy id, so a given deploy creates the pod at most once.

use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info, warn};

use super::cluster::{ClusterClient, ClusterEvent, ListFilter, timestamp_of};
use super::error::{Error, Result};
use super::outcome::{Outcome, ReconcileState, SubReconciler};
use super::status::find_condition;
use crate::config::OperatorConfig;
use crate::crd::{AppPhase, BkApp, ConditionStatus, ConditionType, HealthPhase, HookStatus, HookType};
use crate::resources::hook::{build_pre_release_pod, hook_pod_name, hook_selector};

/// A hook still progressing after this long has timed out.
pub const PROGRESSING_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// A failed hook is given up on this long after it failed.
pub const FAILED_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Finished hook pods kept per app.
pub const HOOK_HISTORY_LIMIT: usize = 3;

/// Where a hook execution stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    NoHookDeclared,
    NotStarted,
    Progressing,
    Succeeded,
    Failed,
    TimedOutProgressing,
    TimedOutFailed,
    Unknown,
}

/// A hook pod and the health derived from it.
#[derive(Debug, Clone)]
pub struct HookInstance {
    pub pod: Pod,
    pub phase: HealthPhase,
    pub reason: String,
    pub message: String,
    pub start_time: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
}

impl HookInstance {
    pub fn from_pod(pod: Pod) -> Self {
        let status = pod.status.clone().unwrap_or_default();
        let phase = match status.phase.as_deref() {
            // The API server defaults a new pod to Pending.
            None | Some("Pending") | Some("Running") => HealthPhase::Progressing,
            Some("Succeeded") => HealthPhase::Healthy,
            Some("Failed") => HealthPhase::Unhealthy,
            _ => HealthPhase::Unknown,
        };
        let created = pod.metadata.creation_timestamp.as_ref().and_then(timestamp_of);
        let start_time = status.start_time.as_ref().and_then(timestamp_of).or(created);

        let terminated = status
            .container_statuses
            .iter()
            .flatten()
            .filter_map(|c| c.state.as_ref()?.terminated.as_ref());
        let failed_at = if phase == HealthPhase::Unhealthy {
            terminated
                .clone()
                .filter_map(|t| t.finished_at.as_ref().and_then(timestamp_of))
                .max()
                .or(created)
        } else {
            None
        };
        let reason = status
            .reason
            .clone()
            .or_else(|| terminated.clone().find_map(|t| t.reason.clone()))
            .unwrap_or_default();
        let message = status
            .message
            .clone()
            .or_else(|| terminated.clone().find_map(|t| t.message.clone()))
            .unwrap_or_default();

        Self {
            pod,
            phase,
            reason,
            message,
            start_time,
            failed_at,
        }
    }

    pub fn timeout_exceeded_progressing(&self, now: Timestamp) -> bool {
        self.phase == HealthPhase::Progressing && exceeded(self.start_time, now, PROGRESSING_TIMEOUT)
    }

    pub fn timeout_exceeded_failed(&self, now: Timestamp) -> bool {
        self.phase == HealthPhase::Unhealthy && exceeded(self.failed_at, now, FAILED_TIMEOUT)
    }

    /// Still executing and within its execution window.
    pub fn is_running_within_timeout(&self, now: Timestamp) -> bool {
        self.phase == HealthPhase::Progressing && !self.timeout_exceeded_progressing(now)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, HealthPhase::Healthy | HealthPhase::Unhealthy)
    }

    pub fn state(&self, now: Timestamp) -> HookState {
        match self.phase {
            HealthPhase::Progressing if self.timeout_exceeded_progressing(now) => {
                HookState::TimedOutProgressing
            }
            HealthPhase::Progressing => HookState::Progressing,
            HealthPhase::Healthy => HookState::Succeeded,
            HealthPhase::Unhealthy if self.timeout_exceeded_failed(now) => HookState::TimedOutFailed,
            HealthPhase::Unhealthy => HookState::Failed,
            HealthPhase::Unknown => HookState::Unknown,
        }
    }

    pub fn to_status(&self, hook_type: HookType) -> HookStatus {
        HookStatus {
            r#type: hook_type,
            started: true,
            start_time: self.start_time.map(|t| t.to_string()),
            phase: self.phase,
            reason: self.reason.clone(),
            message: self.message.clone(),
        }
    }
}

fn exceeded(since: Option<Timestamp>, now: Timestamp, limit: Duration) -> bool {
    since.is_some_and(|t| {
        let elapsed = now.duration_since(t);
        !elapsed.is_negative() && elapsed.unsigned_abs() >= limit
    })
}

/// The deploy already failed on its hook with `reason` in an earlier pass.
///
/// Conditions are reset on every new deploy, so this only holds within the
/// deploy that failed.
fn already_failed(state: &ReconcileState, reason: &str) -> bool {
    let status = state.status();
    status.phase == AppPhase::Failed
        && find_condition(&status.conditions, ConditionType::HooksFinished)
            .is_some_and(|c| c.status == ConditionStatus::False && c.reason == reason)
}

/// Classify the hook of an app given its pod for the current deploy.
pub fn classify(app: &BkApp, instance: Option<&HookInstance>, now: Timestamp) -> HookState {
    if app.pre_release_hook().is_none() {
        return HookState::NoHookDeclared;
    }
    instance.map_or(HookState::NotStarted, |i| i.state(now))
}

/// Upsert the status record of a hook type.
pub fn set_hook_status(state: &mut ReconcileState, hook: HookStatus) {
    let statuses = &mut state.status_mut().hook_statuses;
    match statuses.iter_mut().find(|h| h.r#type == hook.r#type) {
        Some(existing) => *existing = hook,
        None => statuses.push(hook),
    }
}

/// Hook pods of an app, oldest first.
pub async fn list_hook_instances<C: ClusterClient>(
    cluster: &C,
    app: &BkApp,
) -> Result<Vec<HookInstance>> {
    let filter = ListFilter::labels(hook_selector(app)).owned_by(app.uid());
    let mut pods = cluster
        .list::<Pod>(&app.namespace().unwrap_or_default(), &filter)
        .await?;
    pods.sort_by_key(|p| p.metadata.creation_timestamp.as_ref().and_then(timestamp_of));
    Ok(pods.into_iter().map(HookInstance::from_pod).collect())
}

/// Runs the pre-release hook of the current deploy to completion.
#[derive(Debug, Clone)]
pub struct HookReconciler {
    config: std::sync::Arc<OperatorConfig>,
}

impl HookReconciler {
    pub fn new(config: std::sync::Arc<OperatorConfig>) -> Self {
        Self { config }
    }

    async fn run<C: ClusterClient>(&self, cluster: &C, state: &mut ReconcileState) -> Result<Outcome> {
        if classify(&state.app, None, state.now) == HookState::NoHookDeclared {
            state.set_condition(
                ConditionType::HooksFinished,
                ConditionStatus::Unknown,
                "Disabled",
                "no pre-release hook declared",
            );
            return Ok(Outcome::Continue);
        }

        let recorded = state.app.hook_status(HookType::PreRelease).cloned();
        if recorded.as_ref().is_some_and(|h| h.phase == HealthPhase::Healthy) {
            state.set_condition(ConditionType::HooksFinished, ConditionStatus::True, "Finished", "");
            return Ok(Outcome::Continue);
        }

        let namespace = state.namespace();
        let deploy_id = state.status().deploy_id.clone();
        let pod_name = hook_pod_name(&state.app, HookType::PreRelease, &deploy_id);

        let instance = cluster
            .get::<Pod>(&namespace, &pod_name)
            .await?
            .map(HookInstance::from_pod);
        let hook_state = classify(&state.app, instance.as_ref(), state.now);
        if let Some(instance) = instance {
            return self.observe(cluster, state, instance, hook_state).await;
        }

        if recorded
            .as_ref()
            .is_some_and(|h| h.started && h.phase == HealthPhase::Unhealthy)
        {
            // The failed pod is gone; the deploy stays failed until a new one.
            return Ok(Outcome::End);
        }

        self.clean_history(cluster, &state.app).await?;

        let pod = build_pre_release_pod(&state.app, &deploy_id, &self.config)?;
        let created = match cluster.create(&pod).await {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => return Err(Error::HookPodExists(pod_name)),
            Err(e) => return Err(e),
        };
        info!(app = %state.name(), pod = %pod_name, deploy_id = %deploy_id, "Created pre-release hook pod");

        let instance = HookInstance::from_pod(created);
        set_hook_status(
            state,
            HookStatus {
                phase: HealthPhase::Progressing,
                ..instance.to_status(HookType::PreRelease)
            },
        );
        state.set_condition(
            ConditionType::HooksFinished,
            ConditionStatus::False,
            "Progressing",
            "pre-release hook is running",
        );
        state.hook_outcomes.push("created");
        cluster
            .publish_event(
                &state.app,
                ClusterEvent::normal("HookCreated", "RunHook", format!("created hook pod {pod_name}")),
            )
            .await;
        Ok(Outcome::End)
    }

    async fn observe<C: ClusterClient>(
        &self,
        cluster: &C,
        state: &mut ReconcileState,
        instance: HookInstance,
        hook_state: HookState,
    ) -> Result<Outcome> {
        let pod_name = instance.pod.name_any();
        set_hook_status(state, instance.to_status(HookType::PreRelease));

        match hook_state {
            HookState::TimedOutProgressing => {
                let message = format!("hook pod {pod_name} did not finish within {PROGRESSING_TIMEOUT:?}");
                let first = !already_failed(state, "Timeout");
                state.set_condition(ConditionType::HooksFinished, ConditionStatus::False, "Timeout", &message);
                state.set_phase(AppPhase::Failed);
                if first {
                    warn!(app = %state.name(), pod = %pod_name, "Pre-release hook timed out");
                    state.hook_outcomes.push("timeout");
                    cluster
                        .publish_event(&state.app, ClusterEvent::warning("HookTimedOut", "RunHook", message))
                        .await;
                }
                Ok(Outcome::End)
            }
            HookState::TimedOutFailed => {
                let message = format!("hook pod {pod_name} failed: {}", instance.message);
                let first = !already_failed(state, "ExecuteFailed");
                state.set_condition(ConditionType::HooksFinished, ConditionStatus::False, "ExecuteFailed", &message);
                state.set_phase(AppPhase::Failed);
                if first {
                    warn!(app = %state.name(), pod = %pod_name, "Pre-release hook failed");
                    state.hook_outcomes.push("failed");
                    cluster
                        .publish_event(&state.app, ClusterEvent::warning("HookFailed", "RunHook", message))
                        .await;
                }
                Ok(Outcome::End)
            }
            HookState::Progressing => {
                state.set_condition(
                    ConditionType::HooksFinished,
                    ConditionStatus::False,
                    "Progressing",
                    "pre-release hook is running",
                );
                Ok(Outcome::RequeueAfter(PROGRESSING_TIMEOUT))
            }
            HookState::Succeeded => {
                info!(app = %state.name(), pod = %pod_name, "Pre-release hook finished");
                state.set_condition(ConditionType::HooksFinished, ConditionStatus::True, "Finished", "");
                state.hook_outcomes.push("succeeded");
                Ok(Outcome::Continue)
            }
            HookState::Failed => {
                state.set_condition(
                    ConditionType::HooksFinished,
                    ConditionStatus::False,
                    "ExecuteFailed",
                    &instance.message,
                );
                Err(Error::Transient(format!("hook pod {pod_name} failed")))
            }
            HookState::Unknown | HookState::NotStarted | HookState::NoHookDeclared => Err(
                Error::Transient(format!("hook pod {pod_name} is in an unknown state")),
            ),
        }
    }

    /// Delete the oldest finished hook pods beyond the history limit.
    async fn clean_history<C: ClusterClient>(&self, cluster: &C, app: &BkApp) -> Result<()> {
        let finished: Vec<HookInstance> = list_hook_instances(cluster, app)
            .await?
            .into_iter()
            .filter(HookInstance::is_finished)
            .collect();
        let excess = finished.len().saturating_sub(HOOK_HISTORY_LIMIT);
        let namespace = app.namespace().unwrap_or_default();
        for instance in finished.iter().take(excess) {
            cluster.delete::<Pod>(&namespace, &instance.pod.name_any()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: ClusterClient> SubReconciler<C> for HookReconciler {
    fn name(&self) -> &'static str {
        "hooks"
    }

    async fn reconcile(&self, cluster: &C, state: &mut ReconcileState) -> Outcome {
        self.run(cluster, state).await.unwrap_or_else(Outcome::Failed)
    }
}
