//! HorizontalPodAutoscaler generation for BkApp processes.

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec,
    MetricTarget, ResourceMetricSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::common::{owner_reference, process_labels, process_resource_name, stamp_spec_hash};
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{AutoscalingSpec, BkApp, ScalingPolicy};
use crate::envs;

/// Target CPU utilization of the default policy, in percent.
pub const DEFAULT_CPU_UTILIZATION: i32 = 85;

/// Build the HPA of one process from its resolved autoscaling spec.
pub fn build_hpa(app: &BkApp, process: &str, spec: &AutoscalingSpec) -> Result<HorizontalPodAutoscaler> {
    if spec.min_replicas < 1 || spec.max_replicas < spec.min_replicas {
        return Err(Error::Validation(format!(
            "process {process}: autoscaling requires 1 <= minReplicas <= maxReplicas, got {}..{}",
            spec.min_replicas, spec.max_replicas
        )));
    }
    let name = process_resource_name(app, process);
    let metrics = match spec.policy {
        ScalingPolicy::Default => vec![MetricSpec {
            type_: "Resource".to_string(),
            resource: Some(ResourceMetricSource {
                name: "cpu".to_string(),
                target: MetricTarget {
                    type_: "Utilization".to_string(),
                    average_utilization: Some(DEFAULT_CPU_UTILIZATION),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }],
    };

    let mut hpa = HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: app.namespace(),
            labels: Some(process_labels(app, process)),
            owner_references: Some(vec![owner_reference(app)]),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name,
            },
            min_replicas: Some(spec.min_replicas),
            max_replicas: spec.max_replicas,
            metrics: Some(metrics),
            ..Default::default()
        }),
        ..Default::default()
    };
    stamp_spec_hash(&mut hpa)?;
    Ok(hpa)
}

/// Desired HPAs of an app: one per process with a resolved autoscaling spec,
/// none while autoscaling is globally disabled.
pub fn desired_hpas(app: &BkApp, config: &OperatorConfig) -> Result<Vec<HorizontalPodAutoscaler>> {
    if !config.autoscaling_enabled {
        return Ok(Vec::new());
    }
    let env = app.environment();
    app.spec
        .processes
        .iter()
        .filter_map(|p| envs::autoscaling(app, &p.name, env).map(|spec| (p, spec)))
        .map(|(p, spec)| build_hpa(app, &p.name, &spec))
        .collect()
}
