//! Shared context for the controllers.
//!
//! The Context struct holds shared state passed to the reconcilers: cluster
//! access, operator settings, metrics and the retry limiter.

use std::sync::Arc;

use kube::Resource;

use super::backoff::RetryLimiter;
use super::cluster::KubeCluster;
use crate::config::OperatorConfig;
use crate::crd::BkApp;
use crate::health::HealthState;

/// Shared context for the controllers
#[derive(Debug)]
pub struct Context {
    /// Kubernetes access
    pub cluster: KubeCluster,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Requeue delays for failing objects
    pub retry: RetryLimiter,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: kube::Client,
        config: Arc<OperatorConfig>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            cluster: KubeCluster::new(client),
            config,
            health_state,
            retry: RetryLimiter::default(),
        }
    }

    /// Record a finished reconcile and, on success, reset the object's backoff.
    pub fn record_reconcile(&self, kind: &str, namespace: &str, name: &str, secs: f64, ok: bool) {
        if ok {
            self.retry.reset(&retry_key(kind, namespace, name));
        }
        if let Some(health) = &self.health_state {
            health.metrics.record_reconcile(kind, namespace, name, secs);
            if ok {
                health.metrics.record_success(jiff::Timestamp::now().as_second());
            }
        }
    }

    /// Record a failed reconcile by error category.
    pub fn record_failure(&self, kind: &str, category: &str) {
        if let Some(health) = &self.health_state {
            health.metrics.record_failure(kind, category);
        }
    }

    /// Record a hook lifecycle transition.
    pub fn record_hook(&self, outcome: &str) {
        if let Some(health) = &self.health_state {
            health.metrics.record_hook(outcome);
        }
    }

    pub fn record_phase(&self, namespace: &str, name: &str, phase: &str) {
        if let Some(health) = &self.health_state {
            health.metrics.set_app_phase(namespace, name, phase);
        }
    }

    /// Drop the retry state of an object that no longer exists.
    pub fn forget(&self, kind: &str, namespace: &str, name: &str) {
        self.retry.reset(&retry_key(kind, namespace, name));
    }

    /// Drop the retry state and per-app series once the app is gone.
    pub fn forget_app(&self, namespace: &str, name: &str) {
        self.forget(&BkApp::kind(&()), namespace, name);
        if let Some(health) = &self.health_state {
            health.metrics.forget_app(namespace, name);
        }
    }
}

/// Backoff key of an object.
pub fn retry_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}
