//! Custom Resource Definitions (CRDs) for bkapp-operator.
//!
//! - `BkApp`: a deployable application and its processes
//! - `DomainGroupMapping`: domains routed to a `BkApp`

mod bkapp;
mod domain_group_mapping;

pub use bkapp::*;
pub use domain_group_mapping::*;
