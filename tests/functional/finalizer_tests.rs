//! Cleanup on deletion.

use bkapp_operator::controller::cluster::InMemoryCluster;
use bkapp_operator::controller::error::BLOCKING_REQUEUE;
use bkapp_operator::crd::BkApp;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::controller::Action;

use crate::fixtures::*;

#[tokio::test]
async fn test_deletion_cleans_up_and_releases_app() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&with_hook(demo_app())).unwrap();
    let config = config();
    pass(&cluster, &config).await.unwrap();
    cluster.set_pod_phase(NS, &hook_pod("1"), "Succeeded");
    pass(&cluster, &config).await.unwrap();
    assert_eq!(cluster.names::<Service>(NS).len(), 1);

    assert!(cluster.mark_deleted::<BkApp>(NS, APP));
    // The finalizer keeps the app around until cleanup ran
    assert!(cluster.peek::<BkApp>(NS, APP).is_some());

    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::await_change());

    assert!(cluster.peek::<BkApp>(NS, APP).is_none());
    assert!(cluster.names::<Pod>(NS).is_empty());
    assert!(cluster.names::<Service>(NS).is_empty());
    assert!(event_reasons(&cluster).contains(&"Finalized".to_string()));
}

#[tokio::test]
async fn test_deletion_waits_for_running_hook() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&with_hook(demo_app())).unwrap();
    let config = config();
    pass(&cluster, &config).await.unwrap();
    cluster.set_pod_phase(NS, &hook_pod("1"), "Running");

    cluster.mark_deleted::<BkApp>(NS, APP);
    let action = pass(&cluster, &config).await.unwrap();
    assert_eq!(action, Action::requeue(BLOCKING_REQUEUE));
    assert!(cluster.peek::<BkApp>(NS, APP).is_some());
    assert_eq!(cluster.names::<Pod>(NS), vec![hook_pod("1")]);

    cluster.set_pod_phase(NS, &hook_pod("1"), "Succeeded");
    pass(&cluster, &config).await.unwrap();
    assert!(cluster.peek::<BkApp>(NS, APP).is_none());
    assert!(cluster.names::<Pod>(NS).is_empty());
}

#[tokio::test]
async fn test_finalizer_ignores_foreign_services() {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    let cluster = InMemoryCluster::new();
    cluster.insert(&demo_app()).unwrap();
    let config = config();
    pass(&cluster, &config).await.unwrap();

    let foreign = Service {
        metadata: ObjectMeta {
            name: Some("shared-gateway".to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(
                [("bkapp.paas.bk.tencent.com/name".to_string(), APP.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    };
    cluster.insert(&foreign).unwrap();

    cluster.mark_deleted::<BkApp>(NS, APP);
    pass(&cluster, &config).await.unwrap();

    // Not owned by the app, so left alone
    assert_eq!(cluster.names::<Service>(NS), vec!["shared-gateway".to_string()]);
}
