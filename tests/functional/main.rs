// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the BkApp and DomainGroupMapping reconcilers.
//!
//! These tests drive full reconcile passes against `InMemoryCluster`
//! WITHOUT requiring a live Kubernetes cluster. Other cluster components
//! (kubelet, deployment controller, HPA controller) are simulated with the
//! cluster's `set_*` helpers between passes.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_first_deploy_reaches_running
//! ```
//!
//! ## Test Categories
//!
//! - **Deploy tests**: deploy lifecycle, overlays, pruning and idempotence
//! - **Hook tests**: pre-release hook success, failure, timeout and history
//! - **Finalizer tests**: cleanup ordering on deletion
//! - **Mapping tests**: Ingress generation from domain groups
//! - **Scenario tests**: a hooked, overlaid app from first pass to Running

mod deploy_tests;
mod finalizer_tests;
mod fixtures;
mod hook_tests;
mod mapping_tests;

pub use fixtures::*;
