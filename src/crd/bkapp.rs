//! BkApp Custom Resource Definition.
//!
//! A BkApp describes a deployable application: its processes, build image,
//! pre-release hook, environment variables, per-environment overlays and
//! mounts. The operator materializes it into Deployments, Services,
//! HorizontalPodAutoscalers and hook Pods.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation holding the desired deploy id set by the deploy API.
pub const DEPLOY_ID_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/deploy-id";
/// Annotation naming the deploy environment (`stag` or `prod`).
pub const ENVIRONMENT_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/environment";
/// Annotation naming the image pull secret for the app's workloads.
pub const IMAGE_CREDENTIALS_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/image-credentials";
/// Legacy per-process image override table (JSON).
pub const LEGACY_PROC_IMAGE_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/legacy-proc-image-config";
/// Legacy per-process resource override table (JSON).
pub const LEGACY_PROC_RES_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/legacy-proc-res-config";
/// Marks an app built with cloud native buildpacks.
pub const USE_CNB_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/use-cnb";
/// Deploy id the user explicitly interrupted.
pub const INTERRUPTED_DEPLOY_ID_ANNO_KEY: &str = "bkapp.paas.bk.tencent.com/interrupted-deploy-id";

/// BkApp is the root resource of a deployable application.
///
/// Example:
/// ```yaml
/// apiVersion: paas.bk.tencent.com/v1alpha2
/// kind: BkApp
/// metadata:
///   name: demo
///   annotations:
///     bkapp.paas.bk.tencent.com/environment: stag
///     bkapp.paas.bk.tencent.com/deploy-id: "42"
/// spec:
///   build:
///     image: registry.example.com/demo:v1
///   processes:
///     - name: web
///       replicas: 2
///       targetPort: 5000
///       services:
///         - name: http
///           targetPort: 5000
///           port: 80
///           exposedType:
///             name: bk/http
///   hooks:
///     preRelease:
///       command: ["python", "manage.py", "migrate"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "paas.bk.tencent.com",
    version = "v1alpha2",
    kind = "BkApp",
    plural = "bkapps",
    shortname = "bkapp",
    status = "BkAppStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"DeployId", "type":"string", "jsonPath":".status.deployId"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BkAppSpec {
    /// Image the processes run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,

    /// Processes of the application, each becomes a Deployment.
    #[serde(default)]
    pub processes: Vec<Process>,

    /// Lifecycle hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<AppHooks>,

    /// Configuration shared by every environment.
    #[serde(default)]
    pub configuration: AppConfig,

    /// Environment specific overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_overlay: Option<EnvOverlay>,

    /// Volumes mounted into every process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Custom DNS settings for process pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_resolution: Option<DomainResolution>,

    /// Service discovery configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svc_discovery: Option<SvcDiscovery>,

    /// Declared add-on services.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<Addon>,
}

/// Container image configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Image reference.
    #[serde(default)]
    pub image: String,

    /// Image pull policy (default: IfNotPresent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

/// A single process of the application.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Process name, unique within the app (e.g. `web`).
    pub name: String,

    /// Replica count; when unset the overlay or built-in default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Entrypoint override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments to the entrypoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Port the process listens on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,

    /// Resource quota plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_quota_plan: Option<ResQuotaPlan>,

    /// Autoscaling configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingSpec>,

    /// Health probes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<ProbeSet>,

    /// Ports exposed through a Service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ProcService>,
}

/// Named resource quota tiers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ResQuotaPlan {
    /// Falls back to the operator-wide defaults.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// 4 cores, 1Gi memory.
    #[serde(rename = "4C1G")]
    Plan4C1G,
    /// 4 cores, 2Gi memory.
    #[serde(rename = "4C2G")]
    Plan4C2G,
    /// 4 cores, 4Gi memory.
    #[serde(rename = "4C4G")]
    Plan4C4G,
}

impl std::fmt::Display for ResQuotaPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResQuotaPlan::Default => write!(f, "default"),
            ResQuotaPlan::Plan4C1G => write!(f, "4C1G"),
            ResQuotaPlan::Plan4C2G => write!(f, "4C2G"),
            ResQuotaPlan::Plan4C4G => write!(f, "4C4G"),
        }
    }
}

/// Autoscaling configuration of a process.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingSpec {
    /// Lower replica bound.
    pub min_replicas: i32,
    /// Upper replica bound.
    pub max_replicas: i32,
    /// Scaling policy.
    #[serde(default)]
    pub policy: ScalingPolicy,
}

/// Scaling policies understood by the operator.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScalingPolicy {
    /// Scale on CPU utilization.
    #[default]
    Default,
}

/// Probe configuration per probe kind.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<ProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ProbeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<ProbeConfig>,
}

/// A single probe. Exactly one handler should be set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_socket: Option<TcpSocketProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecProbe {
    pub command: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetProbe {
    #[serde(default = "default_probe_path")]
    pub path: String,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

fn default_probe_path() -> String {
    "/".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TcpSocketProbe {
    pub port: i32,
}

/// A port of a process exposed through its Service.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcService {
    /// Port name.
    pub name: String,
    /// Container port.
    pub target_port: i32,
    /// Protocol (default: TCP).
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Service port; defaults to the target port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Marks the port as the app's entrance for domain routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_type: Option<ExposedType>,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// How an exposed port is reached from outside the cluster.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExposedType {
    pub name: ExposedTypeName,
}

/// Exposure protocol.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ExposedTypeName {
    #[default]
    #[serde(rename = "bk/http")]
    Http,
    #[serde(rename = "bk/grpc")]
    Grpc,
}

/// Lifecycle hooks.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppHooks {
    /// Runs once per deploy before processes are updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_release: Option<Hook>,
}

/// A one-shot command.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Configuration shared by all environments.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Ordered environment variables.
    #[serde(default)]
    pub env: Vec<AppEnvVar>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppEnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Deploy environments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnvName {
    Stag,
    Prod,
}

impl EnvName {
    /// Parse an environment tag; unknown tags yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stag" => Some(EnvName::Stag),
            "prod" => Some(EnvName::Prod),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvName::Stag => write!(f, "stag"),
            EnvName::Prod => write!(f, "prod"),
        }
    }
}

/// Environment specific overrides.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvOverlay {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<ReplicasOverlay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_variables: Vec<EnvVarOverlay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub autoscaling: Vec<AutoscalingOverlay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub res_quotas: Vec<ResQuotaOverlay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountOverlay>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasOverlay {
    pub env_name: EnvName,
    pub process: String,
    pub count: i32,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarOverlay {
    pub env_name: EnvName,
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingOverlay {
    pub env_name: EnvName,
    pub process: String,
    pub spec: AutoscalingSpec,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResQuotaOverlay {
    pub env_name: EnvName,
    pub process: String,
    pub plan: ResQuotaPlan,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountOverlay {
    pub env_name: EnvName,
    #[serde(flatten)]
    pub mount: Mount,
}

/// A volume mounted into the app's containers.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub name: String,
    pub mount_path: String,
    pub source: VolumeSource,
}

/// Source of a mount. Exactly one field should be set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<NamedSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<NamedSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_storage: Option<NamedSource>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamedSource {
    pub name: String,
}

/// DNS settings applied to process pods.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainResolution {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_aliases: Vec<HostAlias>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostAlias {
    pub ip: String,
    pub hostnames: Vec<String>,
}

/// Service discovery configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SvcDiscovery {
    #[serde(default, rename = "bkSaaS")]
    pub bk_saas: Vec<SvcDiscEntryBkSaaS>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SvcDiscEntryBkSaaS {
    pub bk_app_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
}

/// A declared add-on service.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    pub name: String,
}

/// Observed state of a BkApp.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppStatus {
    /// Coarse lifecycle phase.
    #[serde(default)]
    pub phase: AppPhase,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Deploy generation the status describes.
    #[serde(default)]
    pub deploy_id: String,

    /// Conditions, at most one per type.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Hook execution records.
    #[serde(default)]
    pub hook_statuses: Vec<HookStatus>,

    /// Last time the controller changed the status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// AppPhase represents the lifecycle phase of a BkApp.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum AppPhase {
    /// A deploy is in progress.
    #[default]
    Pending,
    /// All processes are available.
    Running,
    /// The current deploy failed and will not be retried.
    Failed,
    /// The controller cannot tell.
    Unknown,
}

impl std::fmt::Display for AppPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppPhase::Pending => write!(f, "Pending"),
            AppPhase::Running => write!(f, "Running"),
            AppPhase::Failed => write!(f, "Failed"),
            AppPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Tri-state status of a condition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition describes one aspect of the app's state.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition.
    pub status: ConditionStatus,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// True when type, status, reason, message and generation all match.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Types of conditions for BkApp.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// All processes are serving.
    AppAvailable,
    /// A deploy is rolling out.
    AppProgressing,
    /// Declared add-ons are provisioned.
    AddOnsProvisioned,
    /// The pre-release hook finished.
    HooksFinished,
    /// Autoscalers are able to scale.
    AutoscalingAvailable,
}

impl ConditionType {
    /// Every condition type, in reporting order.
    pub const ALL: [ConditionType; 5] = [
        ConditionType::AppAvailable,
        ConditionType::AppProgressing,
        ConditionType::AddOnsProvisioned,
        ConditionType::HooksFinished,
        ConditionType::AutoscalingAvailable,
    ];
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::AppAvailable => write!(f, "AppAvailable"),
            ConditionType::AppProgressing => write!(f, "AppProgressing"),
            ConditionType::AddOnsProvisioned => write!(f, "AddOnsProvisioned"),
            ConditionType::HooksFinished => write!(f, "HooksFinished"),
            ConditionType::AutoscalingAvailable => write!(f, "AutoscalingAvailable"),
        }
    }
}

/// Hook kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum HookType {
    #[serde(rename = "pre-release")]
    PreRelease,
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookType::PreRelease => write!(f, "pre-release"),
        }
    }
}

/// Health of a hook execution.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum HealthPhase {
    #[default]
    Unknown,
    Progressing,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthPhase::Unknown => write!(f, "Unknown"),
            HealthPhase::Progressing => write!(f, "Progressing"),
            HealthPhase::Healthy => write!(f, "Healthy"),
            HealthPhase::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Execution record of a hook.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookStatus {
    pub r#type: HookType,
    #[serde(default)]
    pub started: bool,
    /// RFC 3339 timestamp of pod creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub phase: HealthPhase,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl BkApp {
    /// Deploy id requested through the annotation, falling back to the generation.
    pub fn desired_deploy_id(&self) -> String {
        self.annotations()
            .get(DEPLOY_ID_ANNO_KEY)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| self.metadata.generation.unwrap_or(0).to_string())
    }

    /// Deploy id recorded on the status, empty before the first deploy.
    pub fn current_deploy_id(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.deploy_id.as_str())
    }

    /// Environment the app runs in, if annotated.
    pub fn environment(&self) -> Option<EnvName> {
        self.annotations()
            .get(ENVIRONMENT_ANNO_KEY)
            .and_then(|v| EnvName::parse(v))
    }

    /// Whether the app image was built with cloud native buildpacks.
    pub fn use_cnb(&self) -> bool {
        self.annotations()
            .get(USE_CNB_ANNO_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Image pull secret referenced by the app.
    pub fn image_credentials(&self) -> Option<&str> {
        self.annotations()
            .get(IMAGE_CREDENTIALS_ANNO_KEY)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether the given deploy was interrupted by the user.
    pub fn is_deploy_interrupted(&self, deploy_id: &str) -> bool {
        self.annotations()
            .get(INTERRUPTED_DEPLOY_ID_ANNO_KEY)
            .is_some_and(|v| v == deploy_id)
    }

    /// Look up a process by name.
    pub fn process(&self, name: &str) -> Option<&Process> {
        self.spec.processes.iter().find(|p| p.name == name)
    }

    /// The declared pre-release hook.
    pub fn pre_release_hook(&self) -> Option<&Hook> {
        self.spec.hooks.as_ref().and_then(|h| h.pre_release.as_ref())
    }

    /// Recorded status of a hook type.
    pub fn hook_status(&self, hook_type: HookType) -> Option<&HookStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.hook_statuses.iter().find(|h| h.r#type == hook_type))
    }

    /// Labels copied from the BkApp onto every child resource.
    pub fn platform_labels(&self) -> BTreeMap<String, String> {
        self.labels()
            .iter()
            .filter(|(k, _)| k.starts_with("bkapp.paas.bk.tencent.com/"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
