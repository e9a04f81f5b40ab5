//! Deploy lifecycle tests.

use bkapp_operator::controller::bkapp_reconciler::{PENDING_REQUEUE, RUNNING_REQUEUE};
use bkapp_operator::controller::cluster::InMemoryCluster;
use bkapp_operator::controller::finalizer::FINALIZER;
use bkapp_operator::crd::{
    AppPhase, AutoscalingSpec, ConditionStatus, ConditionType, ENVIRONMENT_ANNO_KEY, EnvName,
    EnvOverlay, LEGACY_PROC_RES_ANNO_KEY, ReplicasOverlay, ScalingPolicy,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::runtime::controller::Action;

use crate::fixtures::*;

fn replicas(cluster: &InMemoryCluster, name: &str) -> Option<i32> {
    cluster
        .peek::<Deployment>(NS, name)
        .and_then(|d| d.spec)
        .and_then(|s| s.replicas)
}

#[tokio::test]
async fn test_first_deploy_reaches_running() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&demo_app()).unwrap();
    let config = config();

    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::requeue(PENDING_REQUEUE));

    assert!(app(&cluster).finalizers().iter().any(|f| f == FINALIZER));
    assert_eq!(
        cluster.names::<Deployment>(NS),
        vec!["demo--web".to_string(), "demo--worker".to_string()]
    );
    assert_eq!(replicas(&cluster, "demo--web"), Some(2));
    assert_eq!(replicas(&cluster, "demo--worker"), Some(2));
    // Only web declares ports
    assert_eq!(cluster.names::<Service>(NS), vec!["demo--web".to_string()]);

    let st = status(&cluster);
    assert_eq!(st.phase, AppPhase::Pending);
    assert_eq!(st.deploy_id, "1");
    assert_eq!(st.observed_generation, Some(1));
    let available = condition(&st, ConditionType::AppAvailable);
    assert_eq!(available.status, ConditionStatus::False);
    assert_eq!(available.message, "0/2 processes available");
    assert_eq!(condition(&st, ConditionType::AppProgressing).status, ConditionStatus::True);
    let hooks = condition(&st, ConditionType::HooksFinished);
    assert_eq!(hooks.status, ConditionStatus::Unknown);
    assert_eq!(hooks.reason, "Disabled");
    assert_eq!(condition(&st, ConditionType::AddOnsProvisioned).status, ConditionStatus::True);
    assert!(event_reasons(&cluster).contains(&"DeployActionDetected".to_string()));

    roll_out_all(&cluster);
    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::requeue(RUNNING_REQUEUE));

    let st = status(&cluster);
    assert_eq!(st.phase, AppPhase::Running);
    assert_eq!(condition(&st, ConditionType::AppAvailable).status, ConditionStatus::True);
    let progressing = condition(&st, ConditionType::AppProgressing);
    assert_eq!(progressing.status, ConditionStatus::False);
    assert_eq!(progressing.reason, "Finished");
    assert!(st.last_update.is_some());
}

#[tokio::test]
async fn test_converged_app_is_not_touched() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&demo_app()).unwrap();
    let config = config();

    pass(&cluster, &config).await.unwrap();
    roll_out_all(&cluster);
    pass(&cluster, &config).await.unwrap();
    let before = status(&cluster);
    let mutations = cluster.mutation_count();

    for _ in 0..3 {
        let action = pass(&cluster, &config).await.unwrap();
        assert_eq!(action, Action::requeue(RUNNING_REQUEUE));
    }

    assert_eq!(cluster.mutation_count(), mutations);
    assert_eq!(status(&cluster), before);
}

#[tokio::test]
async fn test_stag_overlay_overrides_replicas() {
    let cluster = InMemoryCluster::new();
    let mut app = with_annotation(demo_app(), ENVIRONMENT_ANNO_KEY, "stag");
    app.spec.env_overlay = Some(EnvOverlay {
        replicas: vec![
            ReplicasOverlay {
                env_name: EnvName::Stag,
                process: "web".to_string(),
                count: 10,
            },
            ReplicasOverlay {
                env_name: EnvName::Prod,
                process: "worker".to_string(),
                count: 5,
            },
        ],
        ..Default::default()
    });
    cluster.insert(&app).unwrap();

    pass(&cluster, &config()).await.unwrap();

    assert_eq!(replicas(&cluster, "demo--web"), Some(10));
    assert_eq!(replicas(&cluster, "demo--worker"), Some(2));
}

#[tokio::test]
async fn test_removed_process_is_pruned() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&demo_app()).unwrap();
    let config = config();
    pass(&cluster, &config).await.unwrap();

    update_app(&cluster, |app| app.spec.processes.retain(|p| p.name == "worker")).await;
    pass(&cluster, &config).await.unwrap();

    assert_eq!(cluster.names::<Deployment>(NS), vec!["demo--worker".to_string()]);
    assert!(cluster.names::<Service>(NS).is_empty());
    // The spec change bumped the generation, which is the deploy id
    assert_eq!(status(&cluster).deploy_id, "2");
}

#[tokio::test]
async fn test_replica_change_updates_deployment() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&demo_app()).unwrap();
    let config = config();
    pass(&cluster, &config).await.unwrap();
    roll_out_all(&cluster);
    pass(&cluster, &config).await.unwrap();

    update_app(&cluster, |app| {
        if let Some(web) = app.spec.processes.iter_mut().find(|p| p.name == "web") {
            web.replicas = Some(4);
        }
    })
    .await;
    pass(&cluster, &config).await.unwrap();

    assert_eq!(replicas(&cluster, "demo--web"), Some(4));
    let st = status(&cluster);
    assert_eq!(st.phase, AppPhase::Pending);
    assert_eq!(
        condition(&st, ConditionType::AppAvailable).message,
        "1/2 processes available"
    );
}

#[tokio::test]
async fn test_quota_over_ceiling_fails_validation() {
    let cluster = InMemoryCluster::new();
    let app = with_annotation(
        demo_app(),
        LEGACY_PROC_RES_ANNO_KEY,
        r#"{"web": {"cpu": "8", "memory": "1Gi"}}"#,
    );
    cluster.insert(&app).unwrap();

    let err = pass(&cluster, &config()).await.unwrap_err();
    assert!(err.is_validation());

    let st = status(&cluster);
    assert_eq!(st.phase, AppPhase::Failed);
    let available = condition(&st, ConditionType::AppAvailable);
    assert_eq!(available.status, ConditionStatus::False);
    assert_eq!(available.reason, "ValidationFailed");
    assert!(cluster.peek::<Deployment>(NS, "demo--web").is_none());
    assert!(event_reasons(&cluster).contains(&"ValidationFailed".to_string()));
}

#[tokio::test]
async fn test_autoscaling_creates_hpa_and_reports_health() {
    let cluster = InMemoryCluster::new();
    let mut app = demo_app();
    app.spec.processes[0].autoscaling = Some(AutoscalingSpec {
        min_replicas: 2,
        max_replicas: 5,
        policy: ScalingPolicy::Default,
    });
    cluster.insert(&app).unwrap();
    let config = autoscaling_config();

    pass(&cluster, &config).await.unwrap();

    assert_eq!(
        cluster.names::<HorizontalPodAutoscaler>(NS),
        vec!["demo--web".to_string()]
    );
    let scaling = condition(&status(&cluster), ConditionType::AutoscalingAvailable);
    assert_eq!(scaling.status, ConditionStatus::Unknown);
    assert_eq!(scaling.reason, "Pending");

    cluster.set_status::<HorizontalPodAutoscaler>(
        NS,
        "demo--web",
        serde_json::json!({
            "currentReplicas": 2,
            "desiredReplicas": 2,
            "conditions": [
                {"type": "AbleToScale", "status": "True", "reason": "ReadyForNewScale"},
                {"type": "ScalingActive", "status": "False", "reason": "FailedGetResourceMetric",
                 "message": "missing cpu metrics"}
            ]
        }),
    );
    pass(&cluster, &config).await.unwrap();

    let scaling = condition(&status(&cluster), ConditionType::AutoscalingAvailable);
    assert_eq!(scaling.status, ConditionStatus::False);
    assert_eq!(scaling.reason, "FailedGetResourceMetric");
    assert_eq!(scaling.message, "missing cpu metrics");
}

#[tokio::test]
async fn test_autoscaled_replicas_follow_the_hpa() {
    let cluster = InMemoryCluster::new();
    let mut app = demo_app();
    app.spec.processes[0].autoscaling = Some(AutoscalingSpec {
        min_replicas: 2,
        max_replicas: 5,
        policy: ScalingPolicy::Default,
    });
    cluster.insert(&app).unwrap();
    let config = autoscaling_config();
    pass(&cluster, &config).await.unwrap();

    // The HPA scales web to 4, then an unrelated change rebuilds the Deployment
    let mut live = cluster.peek::<Deployment>(NS, "demo--web").unwrap();
    live.spec.as_mut().unwrap().replicas = Some(4);
    bkapp_operator::controller::cluster::ClusterClient::replace(&cluster, &live)
        .await
        .unwrap();
    update_app(&cluster, |app| app.spec.processes[0].target_port = Some(8000)).await;
    pass(&cluster, &config).await.unwrap();

    let web = cluster.peek::<Deployment>(NS, "demo--web").unwrap();
    assert_eq!(web.spec.unwrap().replicas, Some(4));
}

#[tokio::test]
async fn test_autoscaling_disabled_globally() {
    let cluster = InMemoryCluster::new();
    let mut app = demo_app();
    app.spec.processes[0].autoscaling = Some(AutoscalingSpec {
        min_replicas: 2,
        max_replicas: 5,
        policy: ScalingPolicy::Default,
    });
    cluster.insert(&app).unwrap();

    pass(&cluster, &config()).await.unwrap();

    assert!(cluster.names::<HorizontalPodAutoscaler>(NS).is_empty());
    let scaling = condition(&status(&cluster), ConditionType::AutoscalingAvailable);
    assert_eq!(scaling.reason, "Disabled");
    let web = cluster.peek::<Deployment>(NS, "demo--web").unwrap();
    assert_eq!(web.spec.as_ref().unwrap().replicas, Some(2));
    assert!(web.labels().contains_key("bkapp.paas.bk.tencent.com/name"));
}
