//! Deployment generation for BkApp processes.
//!
//! Each declared process becomes one Deployment named `<app>--<process>`.
//! Output is deterministic for identical inputs so the spec hash annotation
//! can be used to skip no-op updates.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction,
    HTTPGetAction, HostAlias, LocalObjectReference, PodDNSConfig, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::common::{
    SNAPSHOT_ANNO_KEY, app_snapshot, dns_safe, owner_reference, process_labels,
    process_resource_name, selector_labels, stamp_spec_hash,
};
use super::volumes::build_volumes;
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{AppEnvVar, BkApp, EnvName, ProbeConfig, ProbeSet, Process};
use crate::envs::{self, DEFAULT_REPLICAS, LegacyOverrides};
use crate::quota::ResourceQuota;

/// Placeholder in env values replaced with the process name.
pub const PROCESS_TYPE_PLACEHOLDER: &str = "{{bk_var_process_type}}";
/// Env var injected with the service discovery results.
pub const SVC_DISCOVERY_ENV: &str = "BKPAAS_SERVICE_ADDRESSES_BKSAAS";
/// ConfigMap key holding the encoded service discovery results.
pub const SVC_DISCOVERY_KEY: &str = "bk_saas_encoded_json";

/// Name of the ConfigMap holding an app's service discovery results.
pub fn svc_discovery_configmap_name(app: &BkApp) -> String {
    format!("svc-disc-results-{}", app.name_any())
}

/// Build the Deployment of one process.
pub fn build_deployment(app: &BkApp, process_name: &str, config: &OperatorConfig) -> Result<Deployment> {
    let process = app
        .process(process_name)
        .ok_or_else(|| Error::ProcessNotFound(process_name.to_string()))?;
    let env = app.environment();
    let legacy = LegacyOverrides::from_app(app)?;

    let name = process_resource_name(app, process_name);
    let labels = process_labels(app, process_name);
    let replicas = envs::replicas(app, process_name, env).unwrap_or(DEFAULT_REPLICAS);

    let (image, pull_policy) = envs::image(app, &legacy, process_name, config);
    let limits = envs::resource_limits(app, &legacy, process_name, env, config)?;
    let (volumes, volume_mounts) = build_volumes(&envs::mounts(app, env))?;
    let (command, args) = process_command(app, process);

    let container = Container {
        name: dns_safe(process_name),
        image: Some(image),
        image_pull_policy: Some(pull_policy),
        command,
        args,
        env: Some(process_env_vars(app, env, process)),
        ports: process.target_port.map(|port| {
            vec![ContainerPort {
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]
        }),
        resources: Some(resource_requirements(&limits)),
        volume_mounts: non_empty(volume_mounts),
        liveness_probe: probe(process.probes.as_ref(), |p| p.liveness.as_ref()),
        readiness_probe: probe(process.probes.as_ref(), |p| p.readiness.as_ref()),
        startup_probe: probe(process.probes.as_ref(), |p| p.startup.as_ref()),
        ..Default::default()
    };

    let mut annotations = BTreeMap::new();
    annotations.insert(SNAPSHOT_ANNO_KEY.to_string(), app_snapshot(app)?);

    let mut deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: app.namespace(),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(app)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            revision_history_limit: Some(5),
            selector: LabelSelector {
                match_labels: Some(selector_labels(app, process_name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: non_empty(volumes),
                    image_pull_secrets: image_pull_secrets(app),
                    dns_config: dns_config(app),
                    host_aliases: host_aliases(app),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    stamp_spec_hash(&mut deployment)?;
    Ok(deployment)
}

/// Build the Deployments of every declared process, in declaration order.
pub fn build_deployments(app: &BkApp, config: &OperatorConfig) -> Result<Vec<Deployment>> {
    app.spec
        .processes
        .iter()
        .map(|p| build_deployment(app, &p.name, config))
        .collect()
}

/// Entrypoint of a process container.
///
/// Buildpack images start through the process name; declared commands are
/// ignored in that mode.
fn process_command(app: &BkApp, process: &Process) -> (Option<Vec<String>>, Option<Vec<String>>) {
    if app.use_cnb() {
        return (Some(vec![process.name.clone()]), None);
    }
    (
        non_empty(process.command.clone()),
        non_empty(process.args.clone()),
    )
}

/// Env vars of a process container: built-ins, app vars, then discovery.
fn process_env_vars(app: &BkApp, env: Option<EnvName>, process: &Process) -> Vec<EnvVar> {
    let mut builtins = vec![AppEnvVar {
        name: "BKPAAS_PROCESS_TYPE".to_string(),
        value: process.name.clone(),
    }];
    if let Some(port) = process.target_port {
        builtins.push(AppEnvVar {
            name: "PORT".to_string(),
            value: port.to_string(),
        });
    }
    let merged = envs::merge_env_vars(builtins.into_iter().chain(envs::env_vars(app, env)));
    let mut vars: Vec<EnvVar> = merged
        .into_iter()
        .map(|v| EnvVar {
            name: v.name,
            value: Some(v.value.replace(PROCESS_TYPE_PLACEHOLDER, &process.name)),
            value_from: None,
        })
        .collect();
    vars.extend(svc_discovery_env(app));
    vars
}

/// Env var referencing the service discovery ConfigMap, when configured.
pub(crate) fn svc_discovery_env(app: &BkApp) -> Option<EnvVar> {
    let configured = app
        .spec
        .svc_discovery
        .as_ref()
        .is_some_and(|d| !d.bk_saas.is_empty());
    if !configured {
        return None;
    }
    Some(EnvVar {
        name: SVC_DISCOVERY_ENV.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: svc_discovery_configmap_name(app),
                key: SVC_DISCOVERY_KEY.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
    })
}

/// Limits and derived requests.
pub(crate) fn resource_requirements(limits: &ResourceQuota) -> ResourceRequirements {
    let requests = limits.requests();
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), limits.cpu.to_k8s()),
            ("memory".to_string(), limits.memory.to_k8s()),
        ])),
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), requests.cpu.to_k8s()),
            ("memory".to_string(), requests.memory.to_k8s()),
        ])),
        ..Default::default()
    }
}

pub(crate) fn image_pull_secrets(app: &BkApp) -> Option<Vec<LocalObjectReference>> {
    app.image_credentials().map(|name| {
        vec![LocalObjectReference {
            name: name.to_string(),
        }]
    })
}

fn dns_config(app: &BkApp) -> Option<PodDNSConfig> {
    let resolution = app.spec.domain_resolution.as_ref()?;
    if resolution.nameservers.is_empty() {
        return None;
    }
    Some(PodDNSConfig {
        nameservers: Some(resolution.nameservers.clone()),
        ..Default::default()
    })
}

fn host_aliases(app: &BkApp) -> Option<Vec<HostAlias>> {
    let resolution = app.spec.domain_resolution.as_ref()?;
    non_empty(
        resolution
            .host_aliases
            .iter()
            .map(|h| HostAlias {
                ip: h.ip.clone(),
                hostnames: Some(h.hostnames.clone()),
            })
            .collect(),
    )
}

fn probe(probes: Option<&ProbeSet>, pick: impl Fn(&ProbeSet) -> Option<&ProbeConfig>) -> Option<Probe> {
    let cfg = pick(probes?)?;
    Some(Probe {
        exec: cfg.exec.as_ref().map(|e| ExecAction {
            command: Some(e.command.clone()),
        }),
        http_get: cfg.http_get.as_ref().map(|h| HTTPGetAction {
            path: Some(h.path.clone()),
            port: IntOrString::Int(h.port),
            scheme: h.scheme.clone(),
            ..Default::default()
        }),
        tcp_socket: cfg.tcp_socket.as_ref().map(|t| TCPSocketAction {
            port: IntOrString::Int(t.port),
            ..Default::default()
        }),
        initial_delay_seconds: cfg.initial_delay_seconds,
        timeout_seconds: cfg.timeout_seconds,
        period_seconds: cfg.period_seconds,
        success_threshold: cfg.success_threshold,
        failure_threshold: cfg.failure_threshold,
        ..Default::default()
    })
}

pub(crate) fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() { None } else { Some(items) }
}
