//! bkapp-operator library crate
//!
//! This module exports the controllers, CRD definitions, overlay resolvers,
//! quota arithmetic and resource generators.

pub mod config;
pub mod controller;
pub mod crd;
pub mod envs;
pub mod health;
pub mod leader;
pub mod quota;
pub mod resources;

pub use config::OperatorConfig;
pub use health::HealthState;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::Predicate;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::Context;
use controller::{bkapp_reconciler, domain_group_mapping};
use crd::{BkApp, DomainGroupMapping};
use resources::common::{RESOURCE_TYPE_HOOK, RESOURCE_TYPE_LABEL};

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration for all controllers.
///
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Drops events the predicate considers unchanged (status-only updates)
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K, P>(
    api: Api<K>,
    watcher_config: WatcherConfig,
    predicate: P,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
    P: Predicate<K> + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicate);
    (reader, stream)
}

/// Change key of a BkApp: its generation plus its annotations, so a new
/// `deploy-id` triggers a reconcile without a spec change.
fn bkapp_change(app: &BkApp) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    app.metadata.generation.hash(&mut hasher);
    app.annotations().hash(&mut hasher);
    app.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

/// Label selector matching hook pods.
fn hook_pod_selector() -> String {
    format!("{RESOURCE_TYPE_LABEL}={RESOURCE_TYPE_HOOK}")
}

/// Run both controllers until their streams end.
///
/// When `config.watch_namespace` is set only that namespace is watched.
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    config: Arc<OperatorConfig>,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    let scope_msg = namespace.as_deref().unwrap_or("cluster-wide");
    info!(scope = %scope_msg, "Starting BkApp and DomainGroupMapping controllers");

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), config.clone(), health_state));
    futures::join!(
        run_bkapp_controller(client.clone(), ctx.clone(), namespace.as_deref()),
        run_mapping_controller(client, ctx, namespace.as_deref()),
    );

    // This should never complete in normal operation
    error!("Controller streams ended unexpectedly");
}

async fn run_bkapp_controller(client: Client, ctx: Arc<Context>, namespace: Option<&str>) {
    let apps: Api<BkApp> = scoped_api(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let pods: Api<Pod> = scoped_api(client.clone(), namespace);
    let hpas: Api<HorizontalPodAutoscaler> = scoped_api(client, namespace);

    let watcher_config = default_watcher_config();
    let (reader, app_stream) = create_filtered_stream(apps, watcher_config.clone(), bkapp_change);
    let controller_config =
        ControllerConfig::default().concurrency(ctx.config.max_concurrent_reconciles);

    // Deployments are watched in full since availability is read from
    // .status. Everything else only needs metadata.
    let cleanup = ctx.clone();
    Controller::for_stream(app_stream, reader)
        .with_config(controller_config)
        .owns(deployments, watcher_config.clone())
        .owns_stream(metadata_watcher(services, watcher_config.clone()).touched_objects())
        .owns_stream(
            metadata_watcher(pods, watcher_config.clone().labels(&hook_pod_selector()))
                .touched_objects(),
        )
        .owns_stream(metadata_watcher(hpas, watcher_config).touched_objects())
        .run(
            bkapp_reconciler::reconcile,
            bkapp_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| {
            let ctx = cleanup.clone();
            async move {
                match result {
                    Ok((obj, _action)) => debug!("Reconciled BkApp {}", obj.name),
                    Err(e) => {
                        if let Some((namespace, name)) = handle_controller_error(&e) {
                            ctx.forget_app(&namespace, &name);
                        }
                    }
                }
            }
        })
        .await;
}

async fn run_mapping_controller(client: Client, ctx: Arc<Context>, namespace: Option<&str>) {
    let mappings: Api<DomainGroupMapping> = scoped_api(client.clone(), namespace);
    let ingresses: Api<Ingress> = scoped_api(client, namespace);

    let watcher_config = default_watcher_config();
    let (reader, mapping_stream) =
        create_filtered_stream(mappings, watcher_config.clone(), predicates::generation);
    let controller_config =
        ControllerConfig::default().concurrency(ctx.config.max_concurrent_reconciles);

    let cleanup = ctx.clone();
    Controller::for_stream(mapping_stream, reader)
        .with_config(controller_config)
        .owns_stream(metadata_watcher(ingresses, watcher_config).touched_objects())
        .run(
            domain_group_mapping::reconcile,
            domain_group_mapping::error_policy,
            ctx,
        )
        .for_each(|result| {
            let ctx = cleanup.clone();
            async move {
                match result {
                    Ok((obj, _action)) => debug!("Reconciled DomainGroupMapping {}", obj.name),
                    Err(e) => {
                        if let Some((namespace, name)) = handle_controller_error(&e) {
                            ctx.forget(DomainGroupMapping::kind(&()).as_ref(), &namespace, &name);
                        }
                    }
                }
            }
        })
        .await;
}

/// Log a controller stream error. Returns the namespace and name of an
/// object that left the cache so its retry state can be dropped.
fn handle_controller_error(
    e: &kube::runtime::controller::Error<controller::error::Error, watcher::Error>,
) -> Option<(String, String)> {
    // ObjectNotFound/NotFound errors are expected after deletion when
    // related watch events trigger reconciliation for a deleted object.
    match e {
        kube::runtime::controller::Error::ObjectNotFound(obj_ref) => {
            debug!("Object no longer exists (likely deleted): {:?}", e);
            Some((obj_ref.namespace.clone().unwrap_or_default(), obj_ref.name.clone()))
        }
        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found() => {
            debug!("Object no longer exists (likely deleted): {:?}", e);
            None
        }
        _ => {
            error!("Reconciliation error: {:?}", e);
            None
        }
    }
}
