//! Shared builders and helpers for functional tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use bkapp_operator::OperatorConfig;
use bkapp_operator::controller::bkapp_reconciler::{PassReport, reconcile_app, run_pass};
use bkapp_operator::controller::cluster::{ClusterClient, InMemoryCluster};
use bkapp_operator::controller::error::Result;
use bkapp_operator::controller::status::find_condition;
use bkapp_operator::crd::{
    AppHooks, BkApp, BkAppSpec, BkAppStatus, BuildConfig, Condition, ConditionType,
    DEPLOY_ID_ANNO_KEY, Hook, Process, ProcService,
};
use kube::runtime::controller::Action;

/// Namespace every test object lives in.
pub const NS: &str = "bkapp-demo-stag";
/// Name of the default test app.
pub const APP: &str = "demo";

pub fn config() -> Arc<OperatorConfig> {
    Arc::new(OperatorConfig::default())
}

pub fn autoscaling_config() -> Arc<OperatorConfig> {
    Arc::new(OperatorConfig {
        autoscaling_enabled: true,
        ..Default::default()
    })
}

pub fn process(name: &str, replicas: i32) -> Process {
    Process {
        name: name.to_string(),
        replicas: Some(replicas),
        ..Default::default()
    }
}

pub fn http_service() -> ProcService {
    ProcService {
        name: "http".to_string(),
        target_port: 5000,
        protocol: "TCP".to_string(),
        port: Some(80),
        exposed_type: None,
    }
}

/// `web` (2 replicas, one http port) and `worker` (2 replicas).
pub fn demo_app() -> BkApp {
    let mut web = process("web", 2);
    web.target_port = Some(5000);
    web.services = vec![http_service()];
    let mut app = BkApp::new(
        APP,
        BkAppSpec {
            build: Some(BuildConfig {
                image: "registry.example.com/demo:v1".to_string(),
                image_pull_policy: None,
            }),
            processes: vec![web, process("worker", 2)],
            ..Default::default()
        },
    );
    app.metadata.namespace = Some(NS.to_string());
    app
}

pub fn with_hook(mut app: BkApp) -> BkApp {
    app.spec.hooks = Some(AppHooks {
        pre_release: Some(Hook {
            command: vec!["python".to_string(), "manage.py".to_string()],
            args: vec!["migrate".to_string()],
        }),
    });
    app
}

pub fn with_annotation(mut app: BkApp, key: &str, value: &str) -> BkApp {
    app.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    app
}

/// Current stored app.
pub fn app(cluster: &InMemoryCluster) -> BkApp {
    cluster.peek::<BkApp>(NS, APP).expect("app exists")
}

pub fn status(cluster: &InMemoryCluster) -> BkAppStatus {
    app(cluster).status.unwrap_or_default()
}

pub fn condition(status: &BkAppStatus, condition_type: ConditionType) -> Condition {
    find_condition(&status.conditions, condition_type)
        .cloned()
        .unwrap_or_else(|| panic!("condition {condition_type} missing"))
}

/// Run one reconcile pass over the stored app.
pub async fn pass(cluster: &InMemoryCluster, config: &Arc<OperatorConfig>) -> Result<Action> {
    reconcile_app(cluster, config, app(cluster)).await
}

/// Run one pass and keep what it observed.
pub async fn pass_report(cluster: &InMemoryCluster, config: &Arc<OperatorConfig>) -> PassReport {
    run_pass(cluster, config, app(cluster)).await
}

/// Number of published events with `reason`.
pub fn event_count(cluster: &InMemoryCluster, reason: &str) -> usize {
    event_reasons(cluster).iter().filter(|r| *r == reason).count()
}

/// Update the stored app the way a client would.
pub async fn update_app(cluster: &InMemoryCluster, edit: impl FnOnce(&mut BkApp)) {
    let mut current = app(cluster);
    edit(&mut current);
    cluster.replace(&current).await.expect("replace app");
}

pub async fn request_deploy(cluster: &InMemoryCluster, deploy_id: &str) {
    update_app(cluster, |app| {
        app.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(DEPLOY_ID_ANNO_KEY.to_string(), deploy_id.to_string());
    })
    .await;
}

pub fn hook_pod(deploy_id: &str) -> String {
    format!("{APP}-pre-release-hook-{deploy_id}")
}

/// Mark every Deployment in the namespace as rolled out.
pub fn roll_out_all(cluster: &InMemoryCluster) {
    use k8s_openapi::api::apps::v1::Deployment;
    for name in cluster.names::<Deployment>(NS) {
        cluster.set_deployment_available(NS, &name);
    }
}

/// Reasons of the events published so far, in order.
pub fn event_reasons(cluster: &InMemoryCluster) -> Vec<String> {
    cluster.events().into_iter().map(|e| e.event.reason).collect()
}
