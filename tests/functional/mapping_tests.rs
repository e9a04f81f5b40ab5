//! DomainGroupMapping reconcile tests.

use bkapp_operator::controller::cluster::{ClusterClient, InMemoryCluster};
use bkapp_operator::controller::domain_group_mapping::{
    MISSING_APP_REQUEUE, SYNCED_REQUEUE, reconcile_mapping,
};
use bkapp_operator::crd::{
    Domain, DomainGroup, DomainGroupMapping, DomainGroupMappingSpec, DomainSourceType, MappingRef,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use kube::runtime::controller::Action;

use crate::fixtures::*;

const MAPPING: &str = "demo-domains";

fn domain(host: &str, prefixes: &[&str]) -> Domain {
    Domain {
        host: host.to_string(),
        path_prefix_list: prefixes.iter().map(|p| p.to_string()).collect(),
        tls_secret_name: None,
    }
}

fn mapping(groups: Vec<DomainGroup>) -> DomainGroupMapping {
    let mut mapping = DomainGroupMapping::new(
        MAPPING,
        DomainGroupMappingSpec {
            reference: MappingRef {
                name: APP.to_string(),
                kind: "BkApp".to_string(),
                api_version: "paas.bk.tencent.com/v1alpha2".to_string(),
            },
            data: groups,
        },
    );
    mapping.metadata.namespace = Some(NS.to_string());
    mapping
}

fn stored(cluster: &InMemoryCluster) -> DomainGroupMapping {
    cluster
        .peek::<DomainGroupMapping>(NS, MAPPING)
        .expect("mapping exists")
}

async fn sync(cluster: &InMemoryCluster) -> bkapp_operator::controller::error::Result<Action> {
    reconcile_mapping(cluster, &config(), &stored(cluster)).await
}

fn groups() -> Vec<DomainGroup> {
    vec![
        DomainGroup {
            source_type: DomainSourceType::Subdomain,
            domains: vec![domain("demo.apps.example.com", &[])],
        },
        DomainGroup {
            source_type: DomainSourceType::Custom,
            domains: vec![domain("www.demo.com", &["/", "/api/"])],
        },
    ]
}

#[tokio::test]
async fn test_mapping_produces_ingresses() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&demo_app()).unwrap();
    cluster.insert(&mapping(groups())).unwrap();

    let action = sync(&cluster).await.unwrap();
    assert_eq!(action, Action::requeue(SYNCED_REQUEUE));

    let names = cluster.names::<Ingress>(NS);
    assert_eq!(
        names,
        vec![
            "custom-demo-www.demo.com".to_string(),
            "demo-subdomain".to_string()
        ]
    );

    let custom = cluster.peek::<Ingress>(NS, "custom-demo-www.demo.com").unwrap();
    assert_eq!(
        custom.labels().get("bkapp.paas.bk.tencent.com/source-type").map(String::as_str),
        Some("custom")
    );
    let paths: Vec<String> = custom.spec.unwrap().rules.unwrap()[0]
        .http
        .as_ref()
        .unwrap()
        .paths
        .iter()
        .filter_map(|p| p.path.clone())
        .collect();
    assert_eq!(paths, vec!["/()(.*)".to_string(), "/(api)(?:/|$)(.*)".to_string()]);

    let status = stored(&cluster).status.unwrap();
    assert_eq!(status.ingresses, names);
    assert_eq!(status.message, "");
    assert_eq!(status.observed_generation, Some(1));
}

#[tokio::test]
async fn test_removed_domain_group_is_pruned() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&demo_app()).unwrap();
    cluster.insert(&mapping(groups())).unwrap();
    sync(&cluster).await.unwrap();

    let mut current = stored(&cluster);
    current.spec.data.retain(|g| g.source_type != DomainSourceType::Custom);
    cluster.replace(&current).await.unwrap();
    sync(&cluster).await.unwrap();

    assert_eq!(cluster.names::<Ingress>(NS), vec!["demo-subdomain".to_string()]);
    assert_eq!(
        stored(&cluster).status.unwrap().ingresses,
        vec!["demo-subdomain".to_string()]
    );
}

#[tokio::test]
async fn test_synced_mapping_is_not_touched() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&demo_app()).unwrap();
    cluster.insert(&mapping(groups())).unwrap();
    sync(&cluster).await.unwrap();
    let mutations = cluster.mutation_count();

    sync(&cluster).await.unwrap();
    assert_eq!(cluster.mutation_count(), mutations);
}

#[tokio::test]
async fn test_missing_app_is_reported() {
    let cluster = InMemoryCluster::new();
    cluster.insert(&mapping(groups())).unwrap();

    let action = sync(&cluster).await.unwrap();
    assert_eq!(action, Action::requeue(MISSING_APP_REQUEUE));
    assert!(cluster.names::<Ingress>(NS).is_empty());
    assert_eq!(stored(&cluster).status.unwrap().message, "BkApp demo not found");
}

#[tokio::test]
async fn test_app_without_entrance_fails_validation() {
    let cluster = InMemoryCluster::new();
    let mut app = demo_app();
    for p in &mut app.spec.processes {
        p.services.clear();
    }
    cluster.insert(&app).unwrap();
    cluster.insert(&mapping(groups())).unwrap();

    let err = sync(&cluster).await.unwrap_err();
    assert!(err.is_validation());
    assert!(cluster.names::<Ingress>(NS).is_empty());
    assert!(
        stored(&cluster)
            .status
            .unwrap()
            .message
            .contains("exposes no service port")
    );
}
