//! Environment overlay resolution.
//!
//! Every per-process value is resolved from up to four layers, highest
//! precedence first: legacy JSON annotations (images and resources only),
//! the `envOverlay` entry matching the active environment, the spec-level
//! default and finally a built-in constant.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::config::OperatorConfig;
use crate::crd::{
    AppEnvVar, AutoscalingSpec, BkApp, EnvName, LEGACY_PROC_IMAGE_ANNO_KEY,
    LEGACY_PROC_RES_ANNO_KEY, Mount, ResQuotaPlan,
};
use crate::quota::{self, QuotaError, ResourceQuota};

/// Replica count used when nothing configures one.
pub const DEFAULT_REPLICAS: i32 = 1;
/// Image pull policy used when nothing configures one.
pub const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";

/// Image override of a single process from the legacy annotation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LegacyImage {
    pub image: String,
    #[serde(default)]
    pub policy: Option<String>,
}

/// Resource override of a single process from the legacy annotation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LegacyResource {
    pub cpu: String,
    pub memory: String,
}

/// Typed view of the legacy per-process override annotations.
///
/// Parsed once per pass and consulted before any spec field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyOverrides {
    pub images: BTreeMap<String, LegacyImage>,
    pub resources: BTreeMap<String, LegacyResource>,
}

impl LegacyOverrides {
    /// Parse the annotations of an app. Missing annotations yield empty tables.
    pub fn from_app(app: &BkApp) -> Result<Self, serde_json::Error> {
        let annotations = app.metadata.annotations.as_ref();
        let images = match annotations.and_then(|a| a.get(LEGACY_PROC_IMAGE_ANNO_KEY)) {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => BTreeMap::new(),
        };
        let resources = match annotations.and_then(|a| a.get(LEGACY_PROC_RES_ANNO_KEY)) {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => BTreeMap::new(),
        };
        Ok(Self { images, resources })
    }
}

/// Replica count of a process; `None` when no layer configures one.
pub fn replicas(app: &BkApp, process: &str, env: Option<EnvName>) -> Option<i32> {
    let overlay = env.and_then(|env| {
        app.spec
            .env_overlay
            .as_ref()?
            .replicas
            .iter()
            .rev()
            .find(|r| r.env_name == env && r.process == process)
            .map(|r| r.count)
    });
    overlay.or_else(|| app.process(process).and_then(|p| p.replicas))
}

/// Autoscaling spec of a process; `None` when autoscaling is not configured.
pub fn autoscaling(app: &BkApp, process: &str, env: Option<EnvName>) -> Option<AutoscalingSpec> {
    let overlay = env.and_then(|env| {
        app.spec
            .env_overlay
            .as_ref()?
            .autoscaling
            .iter()
            .rev()
            .find(|a| a.env_name == env && a.process == process)
            .map(|a| a.spec.clone())
    });
    overlay.or_else(|| app.process(process).and_then(|p| p.autoscaling.clone()))
}

/// Quota plan of a process.
pub fn res_quota_plan(app: &BkApp, process: &str, env: Option<EnvName>) -> ResQuotaPlan {
    let overlay = env.and_then(|env| {
        app.spec
            .env_overlay
            .as_ref()?
            .res_quotas
            .iter()
            .rev()
            .find(|q| q.env_name == env && q.process == process)
            .map(|q| q.plan)
    });
    overlay
        .or_else(|| app.process(process).and_then(|p| p.res_quota_plan))
        .unwrap_or_default()
}

/// Resource limits of a process.
pub fn resource_limits(
    app: &BkApp,
    legacy: &LegacyOverrides,
    process: &str,
    env: Option<EnvName>,
    config: &OperatorConfig,
) -> Result<ResourceQuota, QuotaError> {
    if let Some(res) = legacy.resources.get(process) {
        return ResourceQuota::parse(&res.cpu, &res.memory);
    }
    quota::from_quota_plan(res_quota_plan(app, process, env), config)
}

/// Image and pull policy of a process.
pub fn image(
    app: &BkApp,
    legacy: &LegacyOverrides,
    process: &str,
    config: &OperatorConfig,
) -> (String, String) {
    let spec_policy = app
        .spec
        .build
        .as_ref()
        .and_then(|b| b.image_pull_policy.clone())
        .filter(|p| !p.is_empty());

    if let Some(legacy) = legacy.images.get(process) {
        let policy = legacy
            .policy
            .clone()
            .filter(|p| !p.is_empty())
            .or(spec_policy)
            .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.to_string());
        return (legacy.image.clone(), policy);
    }

    build_image(app, config)
}

/// Image and pull policy declared by `spec.build`, without legacy overrides.
pub fn build_image(app: &BkApp, config: &OperatorConfig) -> (String, String) {
    let build = app.spec.build.as_ref();
    let image = build
        .map(|b| b.image.clone())
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| config.placeholder_image.clone());
    let policy = build
        .and_then(|b| b.image_pull_policy.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.to_string());
    (image, policy)
}

/// Environment variables of the app.
///
/// The default layer is merged with the overlay of the active environment.
/// Names keep the position they were first seen at; the last value wins.
pub fn env_vars(app: &BkApp, env: Option<EnvName>) -> Vec<AppEnvVar> {
    let defaults = app.spec.configuration.env.iter();
    let overlay = env
        .and_then(|env| {
            app.spec.env_overlay.as_ref().map(|o| {
                o.env_variables
                    .iter()
                    .filter(move |v| v.env_name == env)
                    .map(|v| AppEnvVar {
                        name: v.name.clone(),
                        value: v.value.clone(),
                    })
                    .collect::<Vec<_>>()
            })
        })
        .unwrap_or_default();

    merge_env_vars(defaults.cloned().chain(overlay))
}

/// Merge variables keeping first-seen order and last-seen value.
pub fn merge_env_vars(vars: impl IntoIterator<Item = AppEnvVar>) -> Vec<AppEnvVar> {
    let mut merged: Vec<AppEnvVar> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    for var in vars {
        match index.get(&var.name) {
            Some(&pos) => {
                if let Some(slot) = merged.get_mut(pos) {
                    slot.value = var.value;
                }
            }
            None => {
                index.insert(var.name.clone(), merged.len());
                merged.push(var);
            }
        }
    }
    merged
}

/// Mounts of the app. Overlay mounts replace same-named default mounts.
pub fn mounts(app: &BkApp, env: Option<EnvName>) -> Vec<Mount> {
    let mut result: Vec<Mount> = app.spec.mounts.clone();
    let Some(env) = env else {
        return result;
    };
    let Some(overlay) = app.spec.env_overlay.as_ref() else {
        return result;
    };
    for entry in overlay.mounts.iter().filter(|m| m.env_name == env) {
        match result.iter_mut().find(|m| m.name == entry.mount.name) {
            Some(existing) => *existing = entry.mount.clone(),
            None => result.push(entry.mount.clone()),
        }
    }
    result
}
