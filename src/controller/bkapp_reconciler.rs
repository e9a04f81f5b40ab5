//! BkApp reconciler.
//!
//! One pass runs the sub-reconcilers in order:
//!
//! ```text
//! DeployAction -> Addons -> Hooks -> Processes -> Services -> Autoscaling
//! ```
//!
//! The chain stops at the first step that does not continue; the status is
//! persisted once at the end with a merge patch holding only what changed.
//! Deleted apps run the finalizer instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, warn};

use super::addons::AddonsReconciler;
use super::autoscaling::AutoscalingReconciler;
use super::cluster::{ClusterClient, ClusterEvent};
use super::common::ensure_finalizer;
use super::context::{Context, retry_key};
use super::deploy_action::DeployActionReconciler;
use super::error::{BLOCKING_REQUEUE, Error, Result};
use super::finalizer::{FINALIZER, FinalizerReconciler};
use super::hooks::HookReconciler;
use super::outcome::{Outcome, ReconcileState, run_chain};
use super::processes::ProcessReconciler;
use super::services::ServiceReconciler;
use crate::config::OperatorConfig;
use crate::crd::{AppPhase, BkApp, ConditionStatus, ConditionType};

/// Requeue interval of a running app.
pub const RUNNING_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue interval while a deploy is rolling out.
pub const PENDING_REQUEUE: Duration = Duration::from_secs(30);

const KIND: &str = "BkApp";

/// Result of one reconcile pass plus what it observed.
#[derive(Debug)]
pub struct PassReport {
    pub result: Result<Action>,
    pub phase: Option<AppPhase>,
    pub hook_outcomes: Vec<&'static str>,
}

impl PassReport {
    fn failed(error: Error) -> Self {
        Self {
            result: Err(error),
            phase: None,
            hook_outcomes: Vec::new(),
        }
    }
}

/// Reconcile a BkApp (controller entry point).
pub async fn reconcile(obj: Arc<BkApp>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling BkApp");

    let timeout = ctx.config.reconcile_timeout();
    let report = match tokio::time::timeout(
        timeout,
        run_pass(&ctx.cluster, &ctx.config, obj.as_ref().clone()),
    )
    .await
    {
        Ok(report) => report,
        Err(_) => {
            warn!(name = %name, namespace = %namespace, ?timeout, "Reconcile timed out");
            PassReport::failed(Error::Timeout(timeout))
        }
    };

    ctx.record_reconcile(
        KIND,
        &namespace,
        &name,
        start.elapsed().as_secs_f64(),
        report.result.is_ok(),
    );
    for outcome in &report.hook_outcomes {
        ctx.record_hook(outcome);
    }
    if let Some(phase) = report.phase {
        ctx.record_phase(&namespace, &name, &phase.to_string());
    }
    let finalized = obj.metadata.deletion_timestamp.is_some()
        && matches!(&report.result, Ok(action) if *action == Action::await_change());
    if finalized {
        ctx.forget_app(&namespace, &name);
    }
    report.result
}

/// Error policy for the BkApp controller.
pub fn error_policy(obj: Arc<BkApp>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    ctx.record_failure(KIND, error.category());

    if error.is_not_found() {
        debug!(name = %name, "BkApp not found (likely deleted)");
        ctx.forget(KIND, &namespace, &name);
        return Action::await_change();
    }
    if error.is_blocking() {
        info!(name = %name, reason = %error, "Blocked, retrying shortly");
        return Action::requeue(BLOCKING_REQUEUE);
    }
    if error.is_validation() {
        warn!(name = %name, error = %error, "Invalid BkApp, waiting for a spec change");
        return Action::await_change();
    }
    let delay = ctx.retry.next_delay(&retry_key(KIND, &namespace, &name));
    error!(name = %name, error = %error, ?delay, "Reconcile failed, will retry");
    Action::requeue(delay)
}

/// Reconcile one app against any cluster.
pub async fn reconcile_app<C: ClusterClient>(
    cluster: &C,
    config: &Arc<OperatorConfig>,
    app: BkApp,
) -> Result<Action> {
    run_pass(cluster, config, app).await.result
}

/// Run one pass and report what it observed.
pub async fn run_pass<C: ClusterClient>(
    cluster: &C,
    config: &Arc<OperatorConfig>,
    app: BkApp,
) -> PassReport {
    let mut state = ReconcileState::new(app, cluster.now());

    if state.app.metadata.deletion_timestamp.is_some() {
        let outcome = run_chain(&[&FinalizerReconciler], cluster, &mut state).await;
        return PassReport {
            result: to_action(outcome, state.status().phase),
            phase: None,
            hook_outcomes: state.hook_outcomes,
        };
    }

    if let Err(e) = ensure_finalizer(cluster, &state.app, FINALIZER).await {
        return PassReport::failed(e);
    }

    let deploy_action = DeployActionReconciler;
    let addons = AddonsReconciler;
    let hooks = HookReconciler::new(config.clone());
    let processes = ProcessReconciler::new(config.clone());
    let services = ServiceReconciler;
    let autoscaling = AutoscalingReconciler::new(config.clone());
    let outcome = run_chain(
        &[
            &deploy_action,
            &addons,
            &hooks,
            &processes,
            &services,
            &autoscaling,
        ],
        cluster,
        &mut state,
    )
    .await;

    let generation = state.generation();
    state.status_mut().observed_generation = generation;

    if let Outcome::Failed(e) = &outcome
        && e.is_validation()
    {
        let message = e.to_string();
        state.set_condition(
            ConditionType::AppAvailable,
            ConditionStatus::False,
            "ValidationFailed",
            &message,
        );
        state.set_phase(AppPhase::Failed);
        cluster
            .publish_event(
                &state.app,
                ClusterEvent::warning("ValidationFailed", "Validating", message),
            )
            .await;
    }

    if let Err(e) = state.persist(cluster).await {
        // A step error is more informative than the status write failure.
        let result = match outcome {
            Outcome::Failed(step_error) => Err(step_error),
            _ => Err(e),
        };
        return PassReport {
            result,
            phase: None,
            hook_outcomes: state.hook_outcomes,
        };
    }

    let phase = state.status().phase;
    PassReport {
        result: to_action(outcome, phase),
        phase: Some(phase),
        hook_outcomes: state.hook_outcomes,
    }
}

fn to_action(outcome: Outcome, phase: AppPhase) -> Result<Action> {
    match outcome {
        Outcome::Continue if phase == AppPhase::Running => Ok(Action::requeue(RUNNING_REQUEUE)),
        Outcome::Continue => Ok(Action::requeue(PENDING_REQUEUE)),
        Outcome::RequeueAfter(delay) => Ok(Action::requeue(delay)),
        Outcome::End => Ok(Action::await_change()),
        Outcome::Failed(e) => Err(e),
    }
}
