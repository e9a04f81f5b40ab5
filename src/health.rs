//! Health server for kubelet health checks and Prometheus metrics.
//!
//! - `/healthz` answers as long as the process serves HTTP.
//! - `/readyz` answers 200 only while this replica holds the lease and runs
//!   the controllers.
//! - `/metrics` exposes the registry in the Prometheus text format.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Phases reported by the `app_phase` gauge.
const PHASES: [&str; 4] = ["Pending", "Running", "Failed", "Unknown"];

fn encode_pairs(
    encoder: &mut LabelSetEncoder<'_>,
    pairs: &[(&str, &str)],
) -> Result<(), std::fmt::Error> {
    for pair in pairs {
        pair.encode(encoder.encode_label())?;
    }
    Ok(())
}

/// A reconciled object: controller kind plus namespaced name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ObjectLabels {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ObjectLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        encode_pairs(
            encoder,
            &[
                ("kind", self.kind.as_str()),
                ("namespace", self.namespace.as_str()),
                ("name", self.name.as_str()),
            ],
        )
    }
}

/// Error category of a failed pass.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FailureLabels {
    pub kind: String,
    pub category: String,
}

impl EncodeLabelSet for FailureLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        encode_pairs(
            encoder,
            &[("kind", self.kind.as_str()), ("category", self.category.as_str())],
        )
    }
}

/// Hook transition: `created`, `succeeded`, `failed` or `timed_out`.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct HookLabels {
    pub outcome: String,
}

impl EncodeLabelSet for HookLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        encode_pairs(encoder, &[("outcome", self.outcome.as_str())])
    }
}

/// One series per app and candidate phase.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        encode_pairs(
            encoder,
            &[
                ("namespace", self.namespace.as_str()),
                ("name", self.name.as_str()),
                ("phase", self.phase.as_str()),
            ],
        )
    }
}

/// Operator metrics, all prefixed `bkapp_operator_`.
#[derive(Debug)]
pub struct Metrics {
    pub reconciliations_total: Family<ObjectLabels, Counter>,
    pub reconcile_failures_total: Family<FailureLabels, Counter>,
    pub reconcile_duration_seconds: Family<ObjectLabels, Histogram>,
    pub hook_executions_total: Family<HookLabels, Counter>,
    /// One-hot phase of each app
    pub app_phase: Family<PhaseLabels, Gauge>,
    /// Unix time of the last successful pass of any object
    pub last_success_timestamp: Gauge,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("bkapp_operator");

        let reconciliations_total = Family::<ObjectLabels, Counter>::default();
        registry.register(
            "reconciliations",
            "Reconcile passes, successful or not",
            reconciliations_total.clone(),
        );

        let reconcile_failures_total = Family::<FailureLabels, Counter>::default();
        registry.register(
            "reconcile_failures",
            "Failed reconcile passes by error category",
            reconcile_failures_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ObjectLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "reconcile_duration_seconds",
            "Wall time of a reconcile pass",
            reconcile_duration_seconds.clone(),
        );

        let hook_executions_total = Family::<HookLabels, Counter>::default();
        registry.register(
            "hook_executions",
            "Pre-release hook transitions by outcome",
            hook_executions_total.clone(),
        );

        let app_phase = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "app_phase",
            "Phase of each BkApp, 1 for the active phase",
            app_phase.clone(),
        );

        let last_success_timestamp = Gauge::default();
        registry.register(
            "last_success_timestamp_seconds",
            "Unix time of the last successful reconcile pass",
            last_success_timestamp.clone(),
        );

        Self {
            reconciliations_total,
            reconcile_failures_total,
            reconcile_duration_seconds,
            hook_executions_total,
            app_phase,
            last_success_timestamp,
            registry,
        }
    }

    pub fn record_reconcile(&self, kind: &str, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ObjectLabels {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_success(&self, unix_secs: i64) {
        self.last_success_timestamp.set(unix_secs);
    }

    pub fn record_failure(&self, kind: &str, category: &str) {
        let labels = FailureLabels {
            kind: kind.to_string(),
            category: category.to_string(),
        };
        self.reconcile_failures_total.get_or_create(&labels).inc();
    }

    pub fn record_hook(&self, outcome: &str) {
        let labels = HookLabels {
            outcome: outcome.to_string(),
        };
        self.hook_executions_total.get_or_create(&labels).inc();
    }

    /// Set `phase` to 1 and every other phase of the app to 0.
    pub fn set_app_phase(&self, namespace: &str, name: &str, phase: &str) {
        for candidate in PHASES {
            let labels = PhaseLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                phase: candidate.to_string(),
            };
            self.app_phase
                .get_or_create(&labels)
                .set(i64::from(candidate == phase));
        }
    }

    /// Drop the phase series of a deleted app.
    pub fn forget_app(&self, namespace: &str, name: &str) {
        for candidate in PHASES {
            self.app_phase.remove(&PhaseLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                phase: candidate.to_string(),
            });
        }
    }

    /// Prometheus text exposition of the registry.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// State shared between the controllers and the HTTP handlers.
#[derive(Debug)]
pub struct HealthState {
    ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Starts not ready; `run_controller` flips it once leadership is held.
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not leader").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve health checks and metrics on `0.0.0.0:<port>` until the listener fails.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
