//! Resource generation module.
//!
//! Contains the builders of the Kubernetes objects owned by a BkApp or a
//! DomainGroupMapping.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | Deployment | One per process |
//! | Service | One per process that declares service ports |
//! | Pod | Pre-release hook of a deploy |
//! | HorizontalPodAutoscaler | Processes with autoscaling enabled |
//! | Ingress | Domain groups of a DomainGroupMapping |

pub mod autoscaling;
pub mod common;
pub mod hook;
pub mod ingress;
pub mod process;
pub mod service;
pub mod volumes;

// Re-export commonly used items from common
pub use common::{owner_reference, standard_labels};
