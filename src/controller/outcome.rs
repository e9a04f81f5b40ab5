//! Sub-reconciler chain.
//!
//! A BkApp reconcile pass is a fixed sequence of steps sharing one
//! [`ReconcileState`]. Each step returns an [`Outcome`]; the chain stops at
//! the first step that does not return [`Outcome::Continue`].

use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use kube::ResourceExt;
use serde_json::Value;
use tracing::debug;

use super::cluster::ClusterClient;
use super::error::{Error, Result};
use super::status::{merge_patch_diff, set_condition};
use crate::crd::{AppPhase, BkApp, BkAppStatus, Condition, ConditionStatus, ConditionType};

/// Result of one reconcile step.
#[derive(Debug)]
pub enum Outcome {
    /// Run the next step.
    Continue,
    /// Stop and reconcile again after the delay.
    RequeueAfter(Duration),
    /// Stop; wait for the next watch event.
    End,
    /// Stop with an error.
    Failed(Error),
}

impl Outcome {
    pub fn should_continue(&self) -> bool {
        matches!(self, Outcome::Continue)
    }
}

impl From<Error> for Outcome {
    fn from(e: Error) -> Self {
        Outcome::Failed(e)
    }
}

/// One step of the BkApp reconcile pass.
#[async_trait]
pub trait SubReconciler<C: ClusterClient>: Send + Sync {
    /// Step name used in logs.
    fn name(&self) -> &'static str;

    async fn reconcile(&self, cluster: &C, state: &mut ReconcileState) -> Outcome;
}

/// Run steps in order until one does not continue.
pub async fn run_chain<C: ClusterClient>(
    steps: &[&dyn SubReconciler<C>],
    cluster: &C,
    state: &mut ReconcileState,
) -> Outcome {
    for step in steps {
        let outcome = step.reconcile(cluster, state).await;
        if !outcome.should_continue() {
            debug!(step = step.name(), outcome = ?outcome, "Reconcile chain stopped");
            return outcome;
        }
    }
    Outcome::Continue
}

/// The app being reconciled plus the status last written to the cluster.
#[derive(Debug, Clone)]
pub struct ReconcileState {
    pub app: BkApp,
    persisted: BkAppStatus,
    pub now: Timestamp,
    /// Hook transitions observed during the pass, for metrics.
    pub hook_outcomes: Vec<&'static str>,
}

impl ReconcileState {
    pub fn new(app: BkApp, now: Timestamp) -> Self {
        let persisted = app.status.clone().unwrap_or_default();
        Self {
            app,
            persisted,
            now,
            hook_outcomes: Vec::new(),
        }
    }

    pub fn namespace(&self) -> String {
        self.app.namespace().unwrap_or_default()
    }

    pub fn name(&self) -> String {
        self.app.name_any()
    }

    pub fn generation(&self) -> Option<i64> {
        self.app.metadata.generation
    }

    /// In-memory status; the persisted one until a step writes to it.
    pub fn status(&self) -> &BkAppStatus {
        self.app.status.as_ref().unwrap_or(&self.persisted)
    }

    pub fn status_mut(&mut self) -> &mut BkAppStatus {
        self.app.status.get_or_insert_with(BkAppStatus::default)
    }

    /// Upsert a condition stamped with the current generation.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        let generation = self.generation();
        let condition = Condition::new(condition_type, status, reason, message, generation);
        set_condition(&mut self.status_mut().conditions, condition);
    }

    pub fn set_phase(&mut self, phase: AppPhase) {
        self.status_mut().phase = phase;
    }

    /// Merge patch from the persisted status to the in-memory one.
    pub fn status_patch(&self) -> Result<Option<Value>> {
        let old = serde_json::to_value(&self.persisted)?;
        let new = serde_json::to_value(self.status())?;
        Ok(merge_patch_diff(&old, &new))
    }

    /// Write the in-memory status if it differs from the persisted one.
    /// Returns whether a write happened.
    pub async fn persist<C: ClusterClient>(&mut self, cluster: &C) -> Result<bool> {
        if self.status_patch()?.is_none() {
            return Ok(false);
        }
        self.status_mut().last_update = Some(self.now.to_string());
        let Some(patch) = self.status_patch()? else {
            return Ok(false);
        };
        cluster
            .patch_status::<BkApp>(
                &self.namespace(),
                &self.name(),
                &serde_json::json!({ "status": patch }),
            )
            .await?;
        self.mark_persisted();
        Ok(true)
    }

    /// Treat the in-memory status as written.
    pub fn mark_persisted(&mut self) {
        self.persisted = self.status().clone();
    }
}
