//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! One replica holds the Lease and renews it; the others poll until it
//! expires. The holder identity and timestamps live in the Lease spec, and
//! writes carry the observed `resourceVersion` so two replicas racing for an
//! expired Lease cannot both win.

use std::time::Duration;

use jiff::Timestamp;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::controller::cluster::{FIELD_MANAGER, k8s_time};
use crate::controller::error::{Error, Result};

/// What a replica may do with the Lease as it stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseClaim {
    /// Held by us: bump `renewTime`.
    Renew,
    /// Missing, unheld or expired: take it over.
    Acquire,
    /// Another replica holds a live Lease.
    Busy,
}

/// Current holder of the Lease, if any.
fn holder_of(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty())
}

/// Whether the Lease went unrenewed for longer than its duration.
pub fn is_expired(lease: &Lease, now: Timestamp) -> bool {
    if let Some(spec) = &lease.spec
        && let (Some(renew_time), Some(duration)) = (&spec.renew_time, spec.lease_duration_seconds)
    {
        let elapsed = now.as_second() - renew_time.0.timestamp();
        return elapsed > i64::from(duration);
    }
    true
}

/// Decide what `holder` may do with `lease` at `now`.
pub fn claim(lease: Option<&Lease>, holder: &str, now: Timestamp) -> LeaseClaim {
    let Some(lease) = lease else {
        return LeaseClaim::Acquire;
    };
    match holder_of(lease) {
        Some(current) if current == holder => LeaseClaim::Renew,
        Some(_) if !is_expired(lease, now) => LeaseClaim::Busy,
        _ => LeaseClaim::Acquire,
    }
}

fn micro_time(ts: Timestamp) -> Option<MicroTime> {
    k8s_time(ts).map(|t| MicroTime(t.0))
}

/// Lease-based lock held by at most one operator replica.
#[derive(Clone)]
pub struct LeaderLock {
    api: Api<Lease>,
    lease_name: String,
    holder: String,
    ttl: Duration,
}

impl std::fmt::Debug for LeaderLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderLock")
            .field("lease_name", &self.lease_name)
            .field("holder", &self.holder)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl LeaderLock {
    pub fn new(client: Client, namespace: &str, lease_name: &str, holder: &str, ttl: Duration) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            holder: holder.to_string(),
            ttl,
        }
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.ttl.as_secs()).unwrap_or(i32::MAX)
    }

    /// Take or keep the Lease. Returns whether this replica now leads.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let current = self.api.get_opt(&self.lease_name).await?;
        let now = Timestamp::now();
        match claim(current.as_ref(), &self.holder, now) {
            LeaseClaim::Busy => {
                debug!(
                    lease = %self.lease_name,
                    holder = current.as_ref().and_then(holder_of).unwrap_or("unknown"),
                    "Lease held by another replica"
                );
                Ok(false)
            }
            LeaseClaim::Renew => self.renew(now).await,
            LeaseClaim::Acquire => self.acquire(current.as_ref(), now).await,
        }
    }

    async fn renew(&self, now: Timestamp) -> Result<bool> {
        let patch = json!({
            "spec": {
                "renewTime": micro_time(now),
                "leaseDurationSeconds": self.lease_duration_seconds(),
            }
        });
        self.api
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(true)
    }

    async fn acquire(&self, current: Option<&Lease>, now: Timestamp) -> Result<bool> {
        let transitions = current
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0);
        let now = micro_time(now);
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version: current.and_then(|l| l.resource_version()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.clone()),
                lease_duration_seconds: Some(self.lease_duration_seconds()),
                acquire_time: now.clone(),
                renew_time: now,
                lease_transitions: Some(transitions.saturating_add(1)),
                ..Default::default()
            }),
        };

        match self
            .api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&lease),
            )
            .await
        {
            Ok(_) => {
                info!(lease = %self.lease_name, holder = %self.holder, "Lease acquired");
                Ok(true)
            }
            // Another replica wrote the Lease after we read it
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = %self.lease_name, "Lost the race for the Lease");
                Ok(false)
            }
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
