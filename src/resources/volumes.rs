//! Volumes and mounts for process and hook containers.
//!
//! Each mount source kind knows how to produce its pod volume; the registry
//! below dispatches on the declared source.

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, PersistentVolumeClaimVolumeSource, SecretVolumeSource, Volume,
    VolumeMount,
};

use super::common::dns_safe;
use crate::controller::error::{Error, Result};
use crate::crd::{Mount, VolumeSource};

/// Resolved source of a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    ConfigMap(String),
    Secret(String),
    PersistentStorage(String),
}

impl MountSource {
    /// Resolve the declared source; exactly one kind must be set.
    pub fn from_spec(mount_name: &str, source: &VolumeSource) -> Result<Self> {
        let mut found = Vec::with_capacity(1);
        if let Some(cm) = &source.config_map {
            found.push(MountSource::ConfigMap(cm.name.clone()));
        }
        if let Some(secret) = &source.secret {
            found.push(MountSource::Secret(secret.name.clone()));
        }
        if let Some(pvc) = &source.persistent_storage {
            found.push(MountSource::PersistentStorage(pvc.name.clone()));
        }
        match found.len() {
            1 => found
                .pop()
                .ok_or_else(|| Error::Validation(format!("mount {mount_name} has no source"))),
            0 => Err(Error::Validation(format!("mount {mount_name} has no source"))),
            _ => Err(Error::Validation(format!(
                "mount {mount_name} declares more than one source"
            ))),
        }
    }

    /// Pod volume backed by this source.
    pub fn volume(&self, volume_name: &str) -> Volume {
        match self {
            MountSource::ConfigMap(name) => Volume {
                name: volume_name.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            MountSource::Secret(name) => Volume {
                name: volume_name.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            MountSource::PersistentStorage(name) => Volume {
                name: volume_name.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: name.clone(),
                    read_only: None,
                }),
                ..Default::default()
            },
        }
    }
}

/// Build the pod volumes and container mounts for a set of mounts.
pub fn build_volumes(mounts: &[Mount]) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
    let mut volumes = Vec::with_capacity(mounts.len());
    let mut volume_mounts = Vec::with_capacity(mounts.len());
    for mount in mounts {
        if mount.mount_path.is_empty() || !mount.mount_path.starts_with('/') {
            return Err(Error::Validation(format!(
                "mount {} must have an absolute mount path",
                mount.name
            )));
        }
        let source = MountSource::from_spec(&mount.name, &mount.source)?;
        let volume_name = dns_safe(&mount.name);
        if volumes.iter().any(|v: &Volume| v.name == volume_name) {
            return Err(Error::Validation(format!(
                "duplicate mount name {}",
                mount.name
            )));
        }
        volumes.push(source.volume(&volume_name));
        volume_mounts.push(VolumeMount {
            name: volume_name,
            mount_path: mount.mount_path.clone(),
            ..Default::default()
        });
    }
    Ok((volumes, volume_mounts))
}
