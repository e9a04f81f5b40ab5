//! Pre-release hook tests.

use std::time::Duration;

use bkapp_operator::controller::cluster::InMemoryCluster;
use bkapp_operator::controller::hooks::PROGRESSING_TIMEOUT;
use bkapp_operator::crd::{
    AppPhase, ConditionStatus, ConditionType, HealthPhase, HookType, INTERRUPTED_DEPLOY_ID_ANNO_KEY,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;

use crate::fixtures::*;

fn hook_app(cluster: &InMemoryCluster) {
    cluster.insert(&with_hook(demo_app())).unwrap();
}

#[tokio::test]
async fn test_hook_runs_before_processes() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();

    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(cluster.names::<Pod>(NS), vec![hook_pod("1")]);
    assert!(cluster.names::<Deployment>(NS).is_empty());

    let st = status(&cluster);
    let hooks = condition(&st, ConditionType::HooksFinished);
    assert_eq!(hooks.status, ConditionStatus::False);
    assert_eq!(hooks.reason, "Progressing");
    let record = &st.hook_statuses[0];
    assert_eq!(record.r#type, HookType::PreRelease);
    assert!(record.started);
    assert_eq!(record.phase, HealthPhase::Progressing);
    assert!(event_reasons(&cluster).contains(&"HookCreated".to_string()));

    // Still running: wait, and never create a second pod
    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::requeue(PROGRESSING_TIMEOUT));
    assert_eq!(cluster.names::<Pod>(NS), vec![hook_pod("1")]);

    assert!(cluster.set_pod_phase(NS, &hook_pod("1"), "Succeeded"));
    pass(&cluster, &config).await.unwrap();

    let st = status(&cluster);
    assert_eq!(condition(&st, ConditionType::HooksFinished).status, ConditionStatus::True);
    assert_eq!(st.hook_statuses[0].phase, HealthPhase::Healthy);
    assert_eq!(cluster.names::<Deployment>(NS).len(), 2);

    roll_out_all(&cluster);
    pass(&cluster, &config).await.unwrap();
    assert_eq!(status(&cluster).phase, AppPhase::Running);
    assert_eq!(cluster.names::<Pod>(NS), vec![hook_pod("1")]);
}

#[tokio::test]
async fn test_hook_pod_created_once_per_deploy() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();

    for _ in 0..5 {
        pass(&cluster, &config).await.unwrap();
    }
    assert_eq!(cluster.names::<Pod>(NS).len(), 1);
    let created = event_reasons(&cluster)
        .iter()
        .filter(|r| *r == "HookCreated")
        .count();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn test_hook_progressing_timeout_fails_deploy() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();
    pass(&cluster, &config).await.unwrap();

    cluster.advance(PROGRESSING_TIMEOUT + Duration::from_secs(60));
    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::await_change());

    let st = status(&cluster);
    assert_eq!(st.phase, AppPhase::Failed);
    let hooks = condition(&st, ConditionType::HooksFinished);
    assert_eq!(hooks.status, ConditionStatus::False);
    assert_eq!(hooks.reason, "Timeout");
    assert!(cluster.names::<Deployment>(NS).is_empty());
    assert!(event_reasons(&cluster).contains(&"HookTimedOut".to_string()));
}

#[tokio::test]
async fn test_hook_timeout_reported_once() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();
    pass(&cluster, &config).await.unwrap();

    cluster.advance(PROGRESSING_TIMEOUT + Duration::from_secs(60));
    let report = pass_report(&cluster, &config).await;
    assert_eq!(report.hook_outcomes, vec!["timeout"]);

    for _ in 0..3 {
        let report = pass_report(&cluster, &config).await;
        assert_eq!(report.result.unwrap(), Action::await_change());
        assert!(report.hook_outcomes.is_empty());
    }
    assert_eq!(event_count(&cluster, "HookTimedOut"), 1);
    assert_eq!(status(&cluster).phase, AppPhase::Failed);
}

#[tokio::test]
async fn test_hook_failure_reported_once() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();
    pass(&cluster, &config).await.unwrap();
    cluster.set_pod_phase(NS, &hook_pod("1"), "Failed");
    assert!(pass(&cluster, &config).await.is_err());

    cluster.advance(Duration::from_secs(3 * 60));
    let report = pass_report(&cluster, &config).await;
    assert_eq!(report.hook_outcomes, vec!["failed"]);

    cluster.advance(Duration::from_secs(60));
    let report = pass_report(&cluster, &config).await;
    assert!(report.hook_outcomes.is_empty());
    assert_eq!(event_count(&cluster, "HookFailed"), 1);
}

#[tokio::test]
async fn test_failed_hook_retries_then_gives_up() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();
    pass(&cluster, &config).await.unwrap();

    cluster.set_pod_phase(NS, &hook_pod("1"), "Failed");
    let err = pass(&cluster, &config).await.unwrap_err();
    assert!(err.is_retryable());
    let hooks = condition(&status(&cluster), ConditionType::HooksFinished);
    assert_eq!(hooks.reason, "ExecuteFailed");
    assert_eq!(status(&cluster).phase, AppPhase::Pending);

    cluster.advance(Duration::from_secs(3 * 60));
    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::await_change());

    let st = status(&cluster);
    assert_eq!(st.phase, AppPhase::Failed);
    assert_eq!(st.hook_statuses[0].phase, HealthPhase::Unhealthy);
    assert!(cluster.names::<Deployment>(NS).is_empty());
    assert!(event_reasons(&cluster).contains(&"HookFailed".to_string()));
}

#[tokio::test]
async fn test_new_deploy_blocked_by_running_hook() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();
    pass(&cluster, &config).await.unwrap();
    cluster.set_pod_phase(NS, &hook_pod("1"), "Running");

    request_deploy(&cluster, "2").await;
    let err = pass(&cluster, &config).await.unwrap_err();
    assert!(err.is_blocking());
    assert_eq!(status(&cluster).deploy_id, "1");
    assert_eq!(cluster.names::<Pod>(NS), vec![hook_pod("1")]);

    // Interrupting the running deploy lets the new one through
    update_app(&cluster, |app| {
        app.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(INTERRUPTED_DEPLOY_ID_ANNO_KEY.to_string(), "1".to_string());
    })
    .await;
    pass(&cluster, &config).await.unwrap();

    let st = status(&cluster);
    assert_eq!(st.deploy_id, "2");
    assert_eq!(st.phase, AppPhase::Pending);
    assert_eq!(cluster.names::<Pod>(NS), vec![hook_pod("1"), hook_pod("2")]);
}

#[tokio::test]
async fn test_new_deploy_resets_status_and_reruns_hook() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();
    pass(&cluster, &config).await.unwrap();
    cluster.set_pod_phase(NS, &hook_pod("1"), "Succeeded");
    pass(&cluster, &config).await.unwrap();
    roll_out_all(&cluster);
    pass(&cluster, &config).await.unwrap();
    assert_eq!(status(&cluster).phase, AppPhase::Running);

    request_deploy(&cluster, "2").await;
    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::await_change());

    let st = status(&cluster);
    assert_eq!(st.deploy_id, "2");
    assert_eq!(st.phase, AppPhase::Pending);
    assert_eq!(st.hook_statuses.len(), 1);
    assert_eq!(st.hook_statuses[0].phase, HealthPhase::Progressing);
    let available = condition(&st, ConditionType::AppAvailable);
    assert_eq!(available.reason, "NewDeployment");
    assert_eq!(cluster.names::<Pod>(NS), vec![hook_pod("1"), hook_pod("2")]);
}

#[tokio::test]
async fn test_hook_history_is_bounded() {
    let cluster = InMemoryCluster::new();
    hook_app(&cluster);
    let config = config();

    for id in 1..=5 {
        let deploy_id = id.to_string();
        request_deploy(&cluster, &deploy_id).await;
        pass(&cluster, &config).await.unwrap();
        cluster.set_pod_phase(NS, &hook_pod(&deploy_id), "Succeeded");
        pass(&cluster, &config).await.unwrap();
        cluster.advance(Duration::from_secs(60));
    }

    // Three finished pods are kept besides the latest deploy's
    assert_eq!(
        cluster.names::<Pod>(NS),
        vec![hook_pod("2"), hook_pod("3"), hook_pod("4"), hook_pod("5")]
    );
}
