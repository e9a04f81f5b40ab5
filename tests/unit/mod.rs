// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for bkapp-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod crd_tests {
    use bkapp_operator::crd::{
        AppPhase, BkApp, BkAppSpec, Condition, ConditionStatus, ConditionType, HookType,
    };
    use kube::CustomResourceExt;

    #[test]
    fn test_condition_new() {
        let condition = Condition::new(
            ConditionType::AppAvailable,
            ConditionStatus::True,
            "AppAvailable",
            "all processes available",
            Some(3),
        );
        assert_eq!(condition.r#type, "AppAvailable");
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, "AppAvailable");
        assert_eq!(condition.observed_generation, Some(3));
        assert!(!condition.last_transition_time.is_empty());
    }

    #[test]
    fn test_condition_types_are_distinct() {
        let names: std::collections::BTreeSet<String> =
            ConditionType::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names.len(), ConditionType::ALL.len());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let mut app = BkApp::new("demo", BkAppSpec::default());
        app.status = Some(bkapp_operator::crd::BkAppStatus {
            phase: AppPhase::Running,
            deploy_id: "3".to_string(),
            ..Default::default()
        });
        let value = serde_json::to_value(&app).unwrap();
        assert_eq!(value["status"]["phase"], "Running");
        assert_eq!(value["status"]["deployId"], "3");
        assert_eq!(serde_json::to_value(HookType::PreRelease).unwrap(), "pre-release");
    }

    #[test]
    fn test_crds() {
        let app = BkApp::crd();
        assert_eq!(app.spec.group, "paas.bk.tencent.com");
        assert_eq!(app.spec.names.kind, "BkApp");
        assert_eq!(app.spec.versions[0].name, "v1alpha2");

        let mapping = bkapp_operator::crd::DomainGroupMapping::crd();
        assert_eq!(mapping.spec.names.plural, "domaingroupmappings");
    }
}

mod quota_tests {
    use bkapp_operator::OperatorConfig;
    use bkapp_operator::crd::ResQuotaPlan;
    use bkapp_operator::quota::{
        Quantity, QuotaError, ResourceKind, ResourceQuota, from_quota_plan,
    };

    #[test]
    fn test_requests_of_small_plan() {
        let limits = from_quota_plan(ResQuotaPlan::Plan4C1G, &OperatorConfig::default()).unwrap();
        let requests = limits.requests();
        assert_eq!(requests.cpu.to_string(), "200m");
        assert_eq!(requests.memory.to_string(), "256Mi");
    }

    #[test]
    fn test_requests_of_large_plan() {
        let limits = from_quota_plan(ResQuotaPlan::Plan4C4G, &OperatorConfig::default()).unwrap();
        assert_eq!(limits.memory.to_string(), "4Gi");
        assert_eq!(limits.requests().memory.to_string(), "2Gi");
    }

    #[test]
    fn test_cpu_request_is_fixed() {
        let quota = ResourceQuota::parse("100m", "512Mi").unwrap();
        assert_eq!(quota.requests().cpu.value(), 200);
        let quota = ResourceQuota::parse("2.5", "512Mi").unwrap();
        assert_eq!(quota.requests().cpu.value(), 200);
    }

    #[test]
    fn test_decimal_memory() {
        let quota = ResourceQuota::parse("500m", "1.5Gi").unwrap();
        assert_eq!(quota.memory.to_string(), "1536Mi");
        assert_eq!(quota.requests().memory.to_string(), "384Mi");

        let quota = ResourceQuota::parse("0.5", "512e6").unwrap();
        assert_eq!(quota.cpu.value(), 500);
        assert_eq!(quota.memory.value(), 512_000_000);
    }

    #[test]
    fn test_ceiling() {
        assert!(matches!(
            Quantity::parse("4001m", ResourceKind::Cpu),
            Err(QuotaError::ExceedLimit { .. })
        ));
        assert!(Quantity::parse("4Gi", ResourceKind::Memory).is_ok());
        assert!(matches!(
            Quantity::parse("5Gi", ResourceKind::Memory),
            Err(QuotaError::ExceedLimit { .. })
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            Quantity::parse("lots", ResourceKind::Cpu),
            Err(QuotaError::Parse { .. })
        ));
    }
}

mod envs_tests {
    use bkapp_operator::OperatorConfig;
    use bkapp_operator::crd::{
        BkApp, BkAppSpec, BuildConfig, EnvName, EnvOverlay, LEGACY_PROC_IMAGE_ANNO_KEY, Process,
        ReplicasOverlay,
    };
    use bkapp_operator::envs::{self, LegacyOverrides};
    use std::collections::BTreeMap;

    fn app() -> BkApp {
        BkApp::new(
            "demo",
            BkAppSpec {
                build: Some(BuildConfig {
                    image: "example.com/demo:v1".to_string(),
                    image_pull_policy: Some("Always".to_string()),
                }),
                processes: vec![Process {
                    name: "web".to_string(),
                    replicas: Some(2),
                    ..Default::default()
                }],
                env_overlay: Some(EnvOverlay {
                    replicas: vec![ReplicasOverlay {
                        env_name: EnvName::Prod,
                        process: "web".to_string(),
                        count: 6,
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_replicas_precedence() {
        let app = app();
        assert_eq!(envs::replicas(&app, "web", Some(EnvName::Prod)), Some(6));
        assert_eq!(envs::replicas(&app, "web", Some(EnvName::Stag)), Some(2));
        assert_eq!(envs::replicas(&app, "web", None), Some(2));
        assert_eq!(envs::replicas(&app, "worker", Some(EnvName::Prod)), None);
    }

    #[test]
    fn test_legacy_image_wins_over_build() {
        let mut app = app();
        app.metadata.annotations = Some(BTreeMap::from([(
            LEGACY_PROC_IMAGE_ANNO_KEY.to_string(),
            r#"{"web": {"image": "example.com/legacy:v0"}}"#.to_string(),
        )]));
        let legacy = LegacyOverrides::from_app(&app).unwrap();
        let config = OperatorConfig::default();

        let (image, policy) = envs::image(&app, &legacy, "web", &config);
        assert_eq!(image, "example.com/legacy:v0");
        assert_eq!(policy, "Always");

        let (image, _) = envs::image(&app, &legacy, "worker", &config);
        assert_eq!(image, "example.com/demo:v1");
    }

    #[test]
    fn test_placeholder_image_without_build() {
        let mut app = app();
        app.spec.build = None;
        let (image, policy) = envs::build_image(&app, &OperatorConfig::default());
        assert_eq!(image, "busybox:latest");
        assert_eq!(policy, "IfNotPresent");
    }
}

mod naming_tests {
    use bkapp_operator::crd::{BkApp, BkAppSpec, HookType};
    use bkapp_operator::resources::common::{dns_safe, process_resource_name};
    use bkapp_operator::resources::hook::{hook_pod_name, rewrite_env_placeholders};
    use bkapp_operator::resources::ingress::make_location_path;

    #[test]
    fn test_resource_names() {
        let app = BkApp::new("demo", BkAppSpec::default());
        assert_eq!(process_resource_name(&app, "Web_Worker"), "demo--web-worker");
        assert_eq!(
            hook_pod_name(&app, HookType::PreRelease, "42"),
            "demo-pre-release-hook-42"
        );
        assert_eq!(dns_safe("a_b-"), "a-b");
    }

    #[test]
    fn test_location_paths() {
        assert_eq!(make_location_path("/"), "/()(.*)");
        assert_eq!(make_location_path("/sub-path/"), "/(sub-path)(?:/|$)(.*)");
        assert_eq!(make_location_path("sub-path"), "/(sub-path)(?:/|$)(.*)");
    }

    #[test]
    fn test_env_placeholders() {
        assert_eq!(
            rewrite_env_placeholders("echo ${DB_HOST}:$DB_PORT").unwrap(),
            "echo $(DB_HOST):$(DB_PORT)"
        );
        assert_eq!(rewrite_env_placeholders("no vars").unwrap(), "no vars");
    }
}

mod error_tests {
    use bkapp_operator::controller::error::{BLOCKING_REQUEUE, Error};

    #[test]
    fn test_error_is_retryable() {
        let kube_err = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "timeout".to_string(),
            reason: "Timeout".to_string(),
            code: 504,
        }));
        assert!(kube_err.is_retryable());
        assert_eq!(kube_err.category(), "kube");

        let validation_err = Error::Validation("invalid spec".to_string());
        assert!(!validation_err.is_retryable());
        assert_eq!(validation_err.requeue_after(), None);

        let transient_err = Error::Transient("temporary failure".to_string());
        assert!(transient_err.is_retryable());
    }

    #[test]
    fn test_blocking_errors() {
        let err = Error::LastHookStillRunning("7".to_string());
        assert!(err.is_blocking());
        assert_eq!(err.requeue_after(), Some(BLOCKING_REQUEUE));
        assert_eq!(err.to_string(), "hook of the previous deploy 7 is still running");
    }

    #[test]
    fn test_not_found_from_api() {
        let err = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(err.is_not_found());
    }
}

mod status_tests {
    use bkapp_operator::controller::status::{
        find_condition, merge_patch_diff, reset_conditions, set_condition,
    };
    use bkapp_operator::crd::{Condition, ConditionStatus, ConditionType};
    use serde_json::json;

    #[test]
    fn test_reset_then_update() {
        let mut conditions = reset_conditions("NewDeployment", "", Some(2));
        assert_eq!(conditions.len(), ConditionType::ALL.len());
        let available = find_condition(&conditions, ConditionType::AppAvailable).unwrap();
        assert_eq!(available.status, ConditionStatus::Unknown);

        let changed = set_condition(
            &mut conditions,
            Condition::new(
                ConditionType::AppAvailable,
                ConditionStatus::True,
                "AppAvailable",
                "",
                Some(2),
            ),
        );
        assert!(changed);
        assert_eq!(conditions.len(), ConditionType::ALL.len());
        let available = find_condition(&conditions, ConditionType::AppAvailable).unwrap();
        assert_eq!(available.status, ConditionStatus::True);
        let hooks = find_condition(&conditions, ConditionType::HooksFinished).unwrap();
        assert_eq!(hooks.reason, "NewDeployment");
    }

    #[test]
    fn test_find_condition_missing() {
        let conditions: Vec<Condition> = vec![];
        assert!(find_condition(&conditions, ConditionType::AppAvailable).is_none());
    }

    #[test]
    fn test_merge_patch_diff() {
        let old = json!({"phase": "Pending", "deployId": "1", "lastUpdate": "t0"});
        let new = json!({"phase": "Running", "deployId": "1"});
        assert_eq!(
            merge_patch_diff(&old, &new),
            Some(json!({"phase": "Running", "lastUpdate": null}))
        );
        assert_eq!(merge_patch_diff(&new, &new), None);
    }
}

mod backoff_tests {
    use bkapp_operator::controller::backoff::{ItemExponentialBackoff, MAX_DELAY, RetryLimiter};
    use bkapp_operator::controller::context::retry_key;
    use std::time::Duration;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = ItemExponentialBackoff::new(Duration::from_secs(1), MAX_DELAY);
        let delays: Vec<u64> = (0..10).map(|_| backoff.next_delay("a").as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
        assert_eq!(backoff.next_delay("b"), Duration::from_secs(1));
    }

    #[test]
    fn test_limiter_reset() {
        let limiter = RetryLimiter::default();
        limiter.next_delay("ns/demo");
        limiter.next_delay("ns/demo");
        assert_eq!(limiter.failures("ns/demo"), 2);
        limiter.reset("ns/demo");
        assert_eq!(limiter.failures("ns/demo"), 0);
    }

    #[test]
    fn test_deleted_app_leaves_no_retry_state() {
        let limiter = RetryLimiter::default();
        let app = retry_key("BkApp", "ns", "demo");
        let mapping = retry_key("DomainGroupMapping", "ns", "demo");
        limiter.next_delay(&app);
        limiter.next_delay(&mapping);
        assert_eq!(limiter.tracked(), 2);

        limiter.reset(&app);
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.failures(&mapping), 1);
    }
}
