//! DomainGroupMapping Custom Resource Definition.
//!
//! Associates a BkApp with the domains it is reachable on. Each mapping is
//! turned into Ingress objects owned by the mapping.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DomainGroupMapping binds domain groups to a BkApp.
///
/// Example:
/// ```yaml
/// apiVersion: paas.bk.tencent.com/v1alpha2
/// kind: DomainGroupMapping
/// metadata:
///   name: demo
/// spec:
///   ref:
///     name: demo
///     kind: BkApp
///     apiVersion: paas.bk.tencent.com/v1alpha2
///   data:
///     - sourceType: subdomain
///       domains:
///         - host: demo.example.com
///           pathPrefixList: ["/"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "paas.bk.tencent.com",
    version = "v1alpha2",
    kind = "DomainGroupMapping",
    plural = "domaingroupmappings",
    shortname = "dgmapping",
    status = "DomainGroupMappingStatus",
    namespaced,
    printcolumn = r#"{"name":"App", "type":"string", "jsonPath":".spec.ref.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DomainGroupMappingSpec {
    /// The BkApp the domains route to.
    #[serde(rename = "ref")]
    pub reference: MappingRef,

    /// Domain groups, one per source type.
    #[serde(default)]
    pub data: Vec<DomainGroup>,
}

/// Reference to the owning app.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MappingRef {
    pub name: String,
    #[serde(default = "default_ref_kind")]
    pub kind: String,
    #[serde(default = "default_ref_api_version")]
    pub api_version: String,
}

fn default_ref_kind() -> String {
    "BkApp".to_string()
}

fn default_ref_api_version() -> String {
    "paas.bk.tencent.com/v1alpha2".to_string()
}

/// Domains sharing a source type.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainGroup {
    pub source_type: DomainSourceType,
    #[serde(default)]
    pub domains: Vec<Domain>,
}

/// Where a domain comes from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DomainSourceType {
    /// Platform assigned sub-domain.
    #[default]
    Subdomain,
    /// Platform assigned sub-path on a shared host.
    Subpath,
    /// User supplied domain.
    Custom,
}

impl std::fmt::Display for DomainSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainSourceType::Subdomain => write!(f, "subdomain"),
            DomainSourceType::Subpath => write!(f, "subpath"),
            DomainSourceType::Custom => write!(f, "custom"),
        }
    }
}

/// A host and the path prefixes routed on it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub host: String,
    #[serde(default)]
    pub path_prefix_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

impl Domain {
    /// Path prefixes, defaulting to `/`.
    pub fn path_prefixes(&self) -> Vec<String> {
        if self.path_prefix_list.is_empty() {
            vec!["/".to_string()]
        } else {
            self.path_prefix_list.clone()
        }
    }
}

/// Observed state of a DomainGroupMapping.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainGroupMappingStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Names of the Ingress objects the mapping produced.
    #[serde(default)]
    pub ingresses: Vec<String>,
    /// Why the last sync failed, empty on success.
    #[serde(default)]
    pub message: String,
}
