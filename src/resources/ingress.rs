//! Ingress generation for DomainGroupMapping objects.
//!
//! Platform domains (`subdomain`, `subpath`) produce one Ingress per source
//! type; every `custom` domain gets its own Ingress so user certificates and
//! ingress classes stay isolated.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::common::{SOURCE_TYPE_LABEL, dns_safe, owner_reference, standard_labels, stamp_spec_hash};
use super::service::{ExposedEntrance, exposed_entrance};
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{BkApp, Domain, DomainGroupMapping, DomainSourceType};

const ANNO_USE_REGEX: &str = "nginx.ingress.kubernetes.io/use-regex";
const ANNO_REWRITE_TARGET: &str = "nginx.ingress.kubernetes.io/rewrite-target";
const ANNO_CONFIGURATION_SNIPPET: &str = "nginx.ingress.kubernetes.io/configuration-snippet";
const ANNO_BACKEND_PROTOCOL: &str = "nginx.ingress.kubernetes.io/backend-protocol";
const ANNO_SSL_REDIRECT: &str = "nginx.ingress.kubernetes.io/ssl-redirect";

/// Rewrite target paired with [`make_location_path`].
pub const REWRITE_TARGET: &str = "/$2";
/// Header telling the app which prefix it is mounted under.
pub const SCRIPT_NAME_SNIPPET: &str = "proxy_set_header X-Script-Name /$1;";

/// Location regex of a path prefix.
///
/// Group 1 captures the prefix without slashes, group 2 the remainder:
/// `/` becomes `/()(.*)`, `/sub-path/` and `/sub-path` become
/// `/(sub-path)(?:/|$)(.*)`, which serves both `/sub-path` and
/// `/sub-path/...` and rewrites either to a single leading slash.
pub fn make_location_path(prefix: &str) -> String {
    let segment = prefix.trim().trim_matches('/');
    if segment.is_empty() {
        "/()(.*)".to_string()
    } else {
        format!("/({segment})(?:/|$)(.*)")
    }
}

/// Build every Ingress of a mapping.
pub fn build_ingresses(
    mapping: &DomainGroupMapping,
    app: &BkApp,
    config: &OperatorConfig,
) -> Result<Vec<Ingress>> {
    let entrance = exposed_entrance(app).ok_or_else(|| {
        Error::Validation(format!("app {} exposes no service port", app.name_any()))
    })?;

    let mut shared: BTreeMap<DomainSourceKey, Vec<&Domain>> = BTreeMap::new();
    let mut custom: Vec<&Domain> = Vec::new();
    for group in &mapping.spec.data {
        match group.source_type {
            DomainSourceType::Subdomain => shared
                .entry(DomainSourceKey::Subdomain)
                .or_default()
                .extend(group.domains.iter()),
            DomainSourceType::Subpath => shared
                .entry(DomainSourceKey::Subpath)
                .or_default()
                .extend(group.domains.iter()),
            DomainSourceType::Custom => custom.extend(group.domains.iter()),
        }
    }

    let mut ingresses = Vec::new();
    for (key, domains) in shared {
        if domains.is_empty() {
            continue;
        }
        let source_type = key.source_type();
        let name = format!("{}-{}", app.name_any(), source_type);
        ingresses.push(build_ingress(
            mapping,
            app,
            &entrance,
            name,
            source_type,
            &config.ingress_class_name,
            &domains,
        )?);
    }

    let mut used: BTreeMap<String, usize> = BTreeMap::new();
    for domain in custom {
        let base = format!("custom-{}-{}", app.name_any(), dns_safe(&domain.host));
        let seen = used.entry(base.clone()).or_insert(0);
        let name = if *seen == 0 {
            base
        } else {
            format!("{base}-{seen}")
        };
        *seen += 1;
        ingresses.push(build_ingress(
            mapping,
            app,
            &entrance,
            name,
            DomainSourceType::Custom,
            config.custom_domain_ingress_class(),
            &[domain],
        )?);
    }
    Ok(ingresses)
}

/// Ordering key so shared ingresses come out in a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DomainSourceKey {
    Subdomain,
    Subpath,
}

impl DomainSourceKey {
    fn source_type(self) -> DomainSourceType {
        match self {
            DomainSourceKey::Subdomain => DomainSourceType::Subdomain,
            DomainSourceKey::Subpath => DomainSourceType::Subpath,
        }
    }
}

fn build_ingress(
    mapping: &DomainGroupMapping,
    app: &BkApp,
    entrance: &ExposedEntrance,
    name: String,
    source_type: DomainSourceType,
    class_name: &str,
    domains: &[&Domain],
) -> Result<Ingress> {
    let mut labels = standard_labels(app);
    labels.insert(SOURCE_TYPE_LABEL.to_string(), source_type.to_string());

    let mut annotations = BTreeMap::new();
    if entrance.grpc {
        annotations.insert(ANNO_BACKEND_PROTOCOL.to_string(), "GRPC".to_string());
        annotations.insert(ANNO_SSL_REDIRECT.to_string(), "true".to_string());
    } else {
        annotations.insert(ANNO_USE_REGEX.to_string(), "true".to_string());
        annotations.insert(ANNO_REWRITE_TARGET.to_string(), REWRITE_TARGET.to_string());
        annotations.insert(
            ANNO_CONFIGURATION_SNIPPET.to_string(),
            SCRIPT_NAME_SNIPPET.to_string(),
        );
    }

    let rules = domains
        .iter()
        .map(|domain| IngressRule {
            host: Some(domain.host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: domain_paths(domain, entrance),
            }),
        })
        .collect();

    let mut ingress = Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: mapping.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(mapping)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(class_name.to_string()),
            rules: Some(rules),
            tls: tls_entries(domains),
            ..Default::default()
        }),
        ..Default::default()
    };
    stamp_spec_hash(&mut ingress)?;
    Ok(ingress)
}

fn domain_paths(domain: &Domain, entrance: &ExposedEntrance) -> Vec<HTTPIngressPath> {
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: entrance.service_name.clone(),
            port: Some(ServiceBackendPort {
                name: Some(entrance.port_name.clone()),
                number: None,
            }),
        }),
        ..Default::default()
    };
    if entrance.grpc {
        return vec![HTTPIngressPath {
            path: Some("/".to_string()),
            path_type: "Prefix".to_string(),
            backend,
        }];
    }
    domain
        .path_prefixes()
        .iter()
        .map(|prefix| HTTPIngressPath {
            path: Some(make_location_path(prefix)),
            path_type: "ImplementationSpecific".to_string(),
            backend: backend.clone(),
        })
        .collect()
}

/// TLS entries grouped by secret name.
fn tls_entries(domains: &[&Domain]) -> Option<Vec<IngressTLS>> {
    let mut by_secret: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for domain in domains {
        if let Some(secret) = domain.tls_secret_name.as_deref().filter(|s| !s.is_empty()) {
            let hosts = by_secret.entry(secret).or_default();
            if !hosts.contains(&domain.host) {
                hosts.push(domain.host.clone());
            }
        }
    }
    if by_secret.is_empty() {
        return None;
    }
    Some(
        by_secret
            .into_iter()
            .map(|(secret, hosts)| IngressTLS {
                hosts: Some(hosts),
                secret_name: Some(secret.to_string()),
            })
            .collect(),
    )
}
