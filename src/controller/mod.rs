//! Controller module for bkapp-operator.
//!
//! Contains the reconcile loops, the sub-reconciler chain, error handling,
//! status management and the cluster access seam.
//!
//! This module supports two controllers:
//! - BkApp controller (`bkapp_reconciler` plus its sub-reconcilers)
//! - DomainGroupMapping controller (`domain_group_mapping`)

// Shared modules
pub mod backoff;
pub mod cluster;
pub mod common;
pub mod context;
pub mod error;
pub mod outcome;
pub mod status;

// BkApp controller
pub mod addons;
pub mod autoscaling;
pub mod bkapp_reconciler;
pub mod deploy_action;
pub mod finalizer;
pub mod hooks;
pub mod processes;
pub mod services;

// DomainGroupMapping controller
pub mod domain_group_mapping;
