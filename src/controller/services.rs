//! Process Service reconciliation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use super::cluster::ClusterClient;
use super::common::{prune, upsert};
use super::error::Result;
use super::outcome::{Outcome, ReconcileState, SubReconciler};
use super::processes::owned_process_filter;
use crate::resources::service::build_services;

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceReconciler;

impl ServiceReconciler {
    async fn run<C: ClusterClient>(&self, cluster: &C, state: &mut ReconcileState) -> Result<Outcome> {
        let app = &state.app;
        let mut keep = BTreeSet::new();
        for desired in build_services(app)? {
            keep.insert(desired.name_any());
            upsert(cluster, desired, |desired, live| {
                // Allocated addresses are immutable.
                if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
                    spec.cluster_ip = live_spec.cluster_ip.clone();
                    spec.cluster_ips = live_spec.cluster_ips.clone();
                }
            })
            .await?;
        }
        prune::<_, Service>(
            cluster,
            &state.namespace(),
            &owned_process_filter(app),
            &keep,
        )
        .await?;
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl<C: ClusterClient> SubReconciler<C> for ServiceReconciler {
    fn name(&self) -> &'static str {
        "services"
    }

    async fn reconcile(&self, cluster: &C, state: &mut ReconcileState) -> Outcome {
        self.run(cluster, state).await.unwrap_or_else(Outcome::Failed)
    }
}
