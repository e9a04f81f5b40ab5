//! Operator configuration loaded from the environment.

use envconfig::Envconfig;

use crate::quota::{QuotaError, ResourceQuota};

/// Settings shared by every reconcile pass. Built once at startup.
#[derive(Envconfig, Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// CPU limit of the `default` quota plan.
    #[envconfig(from = "DEFAULT_CPU_LIMIT", default = "4000m")]
    pub default_cpu_limit: String,

    /// Memory limit of the `default` quota plan.
    #[envconfig(from = "DEFAULT_MEMORY_LIMIT", default = "1024Mi")]
    pub default_memory_limit: String,

    /// Ingress class for platform domains.
    #[envconfig(from = "INGRESS_CLASS_NAME", default = "nginx")]
    pub ingress_class_name: String,

    /// Ingress class for user supplied domains; falls back to `ingress_class_name`.
    #[envconfig(from = "CUSTOM_DOMAIN_INGRESS_CLASS_NAME")]
    pub custom_domain_ingress_class_name: Option<String>,

    /// Global autoscaling switch.
    #[envconfig(from = "AUTOSCALING_ENABLED", default = "false")]
    pub autoscaling_enabled: bool,

    /// Image used when an app declares none.
    #[envconfig(from = "PLACEHOLDER_IMAGE", default = "busybox:latest")]
    pub placeholder_image: String,

    /// Upper bound of apps reconciled at once.
    #[envconfig(from = "MAX_CONCURRENT_RECONCILES", default = "10")]
    pub max_concurrent_reconciles: u16,

    /// Deadline of a single reconcile pass, in seconds.
    #[envconfig(from = "RECONCILE_TIMEOUT_SECS", default = "60")]
    pub reconcile_timeout_secs: u64,

    /// Port of the health and metrics server.
    #[envconfig(from = "HEALTH_PORT", default = "8080")]
    pub health_port: u16,

    /// Restrict the watch to one namespace.
    #[envconfig(from = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_cpu_limit: "4000m".to_string(),
            default_memory_limit: "1024Mi".to_string(),
            ingress_class_name: "nginx".to_string(),
            custom_domain_ingress_class_name: None,
            autoscaling_enabled: false,
            placeholder_image: "busybox:latest".to_string(),
            max_concurrent_reconciles: 10,
            reconcile_timeout_secs: 60,
            health_port: 8080,
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Reject settings the operator cannot run with.
    pub fn validate(&self) -> Result<(), QuotaError> {
        ResourceQuota::parse(&self.default_cpu_limit, &self.default_memory_limit)?;
        Ok(())
    }

    /// Ingress class used for custom domains.
    pub fn custom_domain_ingress_class(&self) -> &str {
        self.custom_domain_ingress_class_name
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.ingress_class_name)
    }

    /// Reconcile deadline as a duration.
    pub fn reconcile_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconcile_timeout_secs.max(1))
    }
}
