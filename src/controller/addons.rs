//! Add-on readiness reporting.
//!
//! Add-ons are provisioned by the platform before the BkApp is applied; the
//! controller only reflects the declared set on `AddOnsProvisioned`.

use async_trait::async_trait;

use super::cluster::ClusterClient;
use super::outcome::{Outcome, ReconcileState, SubReconciler};
use crate::crd::{ConditionStatus, ConditionType};

#[derive(Debug, Clone, Copy, Default)]
pub struct AddonsReconciler;

#[async_trait]
impl<C: ClusterClient> SubReconciler<C> for AddonsReconciler {
    fn name(&self) -> &'static str {
        "addons"
    }

    async fn reconcile(&self, _cluster: &C, state: &mut ReconcileState) -> Outcome {
        let names: Vec<&str> = state.app.spec.addons.iter().map(|a| a.name.as_str()).collect();
        let message = if names.is_empty() {
            String::new()
        } else {
            format!("provisioned: {}", names.join(", "))
        };
        state.set_condition(
            ConditionType::AddOnsProvisioned,
            ConditionStatus::True,
            "Provisioned",
            &message,
        );
        Outcome::Continue
    }
}
