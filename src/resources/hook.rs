//! Pre-release hook pod generation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use regex::Regex;

use super::common::{
    HOOK_TYPE_LABEL, RESOURCE_TYPE_HOOK, RESOURCE_TYPE_LABEL, dns_safe, owner_reference,
    standard_labels,
};
use super::process::{image_pull_secrets, non_empty, resource_requirements, svc_discovery_env};
use super::volumes::build_volumes;
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{BkApp, HookType, ResQuotaPlan};
use crate::envs;
use crate::quota;

/// Entrypoint of buildpack images.
pub const CNB_LAUNCHER: &str = "launcher";

/// Name of the hook pod of a deploy. One name per deploy id keeps creation
/// exactly-once.
pub fn hook_pod_name(app: &BkApp, hook_type: HookType, deploy_id: &str) -> String {
    format!(
        "{}-{}-hook-{}",
        app.name_any(),
        hook_type,
        dns_safe(deploy_id)
    )
}

/// Labels of every hook pod of an app.
pub fn hook_labels(app: &BkApp, hook_type: HookType) -> BTreeMap<String, String> {
    let mut labels = standard_labels(app);
    labels.insert(RESOURCE_TYPE_LABEL.to_string(), RESOURCE_TYPE_HOOK.to_string());
    labels.insert(HOOK_TYPE_LABEL.to_string(), hook_type.to_string());
    labels
}

/// Labels used to list the hook pods of an app.
pub fn hook_selector(app: &BkApp) -> BTreeMap<String, String> {
    let mut labels = super::common::app_selector(app);
    labels.insert(RESOURCE_TYPE_LABEL.to_string(), RESOURCE_TYPE_HOOK.to_string());
    labels
}

/// Rewrite shell style `${VAR}` and `$VAR` references into the
/// Kubernetes `$(VAR)` form expanded by the kubelet.
pub fn rewrite_env_placeholders(raw: &str) -> Result<String> {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .map_err(|e| Error::Permanent(format!("invalid placeholder pattern: {e}")))?;
    Ok(pattern
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            format!("$({name})")
        })
        .into_owned())
}

/// Build the pre-release hook pod for the app's current deploy.
pub fn build_pre_release_pod(app: &BkApp, deploy_id: &str, config: &OperatorConfig) -> Result<Pod> {
    let hook = app
        .pre_release_hook()
        .ok_or_else(|| Error::Validation("no pre-release hook declared".to_string()))?;
    let env = app.environment();

    let command: Vec<String> = hook
        .command
        .iter()
        .map(|c| rewrite_env_placeholders(c))
        .collect::<Result<_>>()?;
    let args: Vec<String> = hook
        .args
        .iter()
        .map(|a| rewrite_env_placeholders(a))
        .collect::<Result<_>>()?;
    let (command, args) = if app.use_cnb() {
        (
            Some(vec![CNB_LAUNCHER.to_string()]),
            non_empty(command.into_iter().chain(args).collect()),
        )
    } else {
        (non_empty(command), non_empty(args))
    };

    let mut env_vars: Vec<EnvVar> = envs::env_vars(app, env)
        .into_iter()
        .map(|v| EnvVar {
            name: v.name,
            value: Some(v.value),
            value_from: None,
        })
        .collect();
    env_vars.extend(svc_discovery_env(app));

    let (image, pull_policy) = envs::build_image(app, config);
    let limits = quota::from_quota_plan(ResQuotaPlan::Default, config)?;
    let (volumes, volume_mounts) = build_volumes(&envs::mounts(app, env))?;

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(hook_pod_name(app, HookType::PreRelease, deploy_id)),
            namespace: app.namespace(),
            labels: Some(hook_labels(app, HookType::PreRelease)),
            owner_references: Some(vec![owner_reference(app)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "hook".to_string(),
                image: Some(image),
                image_pull_policy: Some(pull_policy),
                command,
                args,
                env: non_empty(env_vars),
                resources: Some(resource_requirements(&limits)),
                volume_mounts: non_empty(volume_mounts),
                ..Default::default()
            }],
            volumes: non_empty(volumes),
            image_pull_secrets: image_pull_secrets(app),
            ..Default::default()
        }),
        ..Default::default()
    })
}
