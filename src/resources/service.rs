//! Service generation for BkApp processes.
//!
//! A process that declares `services[]` gets one ClusterIP Service named
//! `<app>--<process>` selecting its pods.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::common::{
    owner_reference, process_labels, process_resource_name, selector_labels, stamp_spec_hash,
};
use crate::controller::error::{Error, Result};
use crate::crd::{BkApp, ExposedTypeName, ProcService};

/// Generate the Service of a process, or `None` if it exposes no ports.
pub fn build_service(app: &BkApp, process_name: &str) -> Result<Option<Service>> {
    let process = app
        .process(process_name)
        .ok_or_else(|| Error::ProcessNotFound(process_name.to_string()))?;
    if process.services.is_empty() {
        return Ok(None);
    }

    let ports = process.services.iter().map(service_port).collect();
    let mut service = Service {
        metadata: ObjectMeta {
            name: Some(process_resource_name(app, process_name)),
            namespace: app.namespace(),
            labels: Some(process_labels(app, process_name)),
            owner_references: Some(vec![owner_reference(app)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(app, process_name)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    };
    stamp_spec_hash(&mut service)?;
    Ok(Some(service))
}

/// Generate the Services of every process that exposes ports.
pub fn build_services(app: &BkApp) -> Result<Vec<Service>> {
    let mut services = Vec::new();
    for process in &app.spec.processes {
        if let Some(service) = build_service(app, &process.name)? {
            services.push(service);
        }
    }
    Ok(services)
}

fn service_port(svc: &ProcService) -> ServicePort {
    ServicePort {
        name: Some(svc.name.clone()),
        port: svc.port.unwrap_or(svc.target_port),
        target_port: Some(IntOrString::Int(svc.target_port)),
        protocol: Some(svc.protocol.clone()),
        ..Default::default()
    }
}

/// The process and port an app's domains route to.
///
/// The first port marked with an exposed type wins; otherwise the first
/// port of the `web` process, if any.
pub fn exposed_entrance(app: &BkApp) -> Option<ExposedEntrance> {
    let marked = app.spec.processes.iter().find_map(|p| {
        p.services.iter().find_map(|s| {
            s.exposed_type.as_ref().map(|t| ExposedEntrance {
                process: p.name.clone(),
                service_name: process_resource_name(app, &p.name),
                port_name: s.name.clone(),
                port: s.port.unwrap_or(s.target_port),
                grpc: t.name == ExposedTypeName::Grpc,
            })
        })
    });
    marked.or_else(|| {
        let web = app.process("web")?;
        let svc = web.services.first()?;
        Some(ExposedEntrance {
            process: web.name.clone(),
            service_name: process_resource_name(app, &web.name),
            port_name: svc.name.clone(),
            port: svc.port.unwrap_or(svc.target_port),
            grpc: false,
        })
    })
}

/// Backend of an app's ingress routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedEntrance {
    pub process: String,
    pub service_name: String,
    pub port_name: String,
    pub port: i32,
    pub grpc: bool,
}
