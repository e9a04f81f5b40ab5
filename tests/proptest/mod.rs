// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for bkapp-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;

use bkapp_operator::controller::backoff::{ItemExponentialBackoff, MAX_DELAY};
use bkapp_operator::crd::{
    AppEnvVar, BkApp, BkAppSpec, EnvName, EnvOverlay, Process, ReplicasOverlay,
};
use bkapp_operator::envs;
use bkapp_operator::quota::{MEMORY_HALF_RATIO_THRESHOLD, Quantity, ResourceKind, ResourceQuota};
use bkapp_operator::resources::common::dns_safe;
use bkapp_operator::resources::ingress::make_location_path;

/// Strategy for CPU limits within the ceiling (1m-4000m).
fn cpu_millis() -> impl Strategy<Value = i64> {
    1..=4000i64
}

/// Strategy for memory limits within the ceiling (1Mi-4096Mi).
fn memory_mib() -> impl Strategy<Value = i64> {
    1..=4096i64
}

fn any_env() -> impl Strategy<Value = EnvName> {
    prop_oneof![Just(EnvName::Stag), Just(EnvName::Prod)]
}

/// Strategy for a path segment such as `api` or `sub-path`.
fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}"
}

fn env_var() -> impl Strategy<Value = AppEnvVar> {
    ("[A-C]", "[a-z]{0,4}").prop_map(|(name, value)| AppEnvVar { name, value })
}

fn app_with_replicas(base: Option<i32>, overlays: Vec<(EnvName, i32)>) -> BkApp {
    BkApp::new(
        "demo",
        BkAppSpec {
            processes: vec![Process {
                name: "web".to_string(),
                replicas: base,
                ..Default::default()
            }],
            env_overlay: Some(EnvOverlay {
                replicas: overlays
                    .into_iter()
                    .map(|(env_name, count)| ReplicasOverlay {
                        env_name,
                        process: "web".to_string(),
                        count,
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

proptest! {
    /// Property: The memory request never exceeds the limit; the CPU request is fixed.
    #[test]
    fn test_requests_of_any_limit(cpu in cpu_millis(), mem in memory_mib()) {
        let limits = ResourceQuota::parse(&format!("{cpu}m"), &format!("{mem}Mi")).unwrap();
        let requests = limits.requests();
        prop_assert!(requests.memory.value() <= limits.memory.value());
        prop_assert_eq!(requests.cpu.value(), 200);
    }

    /// Property: A decimal mantissa parses to the exact byte count, rounded up.
    #[test]
    fn test_decimal_memory_rounds_up(whole in 0..4i64, tenths in 0..10i64) {
        let raw = format!("{whole}.{tenths}Gi");
        let parsed = Quantity::parse(&raw, ResourceKind::Memory).unwrap();
        let tenth_bytes = 1024 * 1024 * 1024 * (whole * 10 + tenths);
        prop_assert_eq!(parsed.value(), (tenth_bytes + 9) / 10);
    }

    /// Property: The memory request is the floored half or quarter of the limit.
    #[test]
    fn test_memory_request_ratio(mem in memory_mib()) {
        let limit = Quantity::from_bytes(mem * 1024 * 1024);
        let request = ResourceQuota { cpu: Quantity::from_millicores(1000), memory: limit }
            .requests()
            .memory;
        let divisor = if limit.value() >= MEMORY_HALF_RATIO_THRESHOLD { 2 } else { 4 };
        prop_assert_eq!(request.value(), limit.value() / divisor);
    }

    /// Property: Parsing a formatted quantity yields the same quantity.
    #[test]
    fn test_quantity_display_parses_back(mem in memory_mib()) {
        let quantity = Quantity::from_bytes(mem * 1024 * 1024);
        let parsed = Quantity::parse(&quantity.to_string(), quantity.kind()).unwrap();
        prop_assert_eq!(parsed, quantity);
    }

    /// Property: The overlay of the active environment wins over the process field.
    #[test]
    fn test_replicas_overlay_precedence(
        base in proptest::option::of(0..20i32),
        overlays in prop::collection::vec((any_env(), 0..20i32), 0..4),
        env in proptest::option::of(any_env()),
    ) {
        let app = app_with_replicas(base, overlays.clone());
        let expected = env
            .and_then(|env| overlays.iter().rev().find(|(e, _)| *e == env).map(|(_, c)| *c))
            .or(base);
        prop_assert_eq!(envs::replicas(&app, "web", env), expected);
    }

    /// Property: Location paths always carry both capture groups.
    #[test]
    fn test_location_path_shape(seg in segment(), leading in any::<bool>(), trailing in any::<bool>()) {
        let prefix = format!(
            "{}{}{}",
            if leading { "/" } else { "" },
            seg,
            if trailing { "/" } else { "" }
        );
        let path = make_location_path(&prefix);
        prop_assert_eq!(path, format!("/({seg})(?:/|$)(.*)"));
    }

    /// Property: Sanitized names only use characters valid in object names.
    #[test]
    fn test_dns_safe_charset(raw in "\\PC{0,40}") {
        let name = dns_safe(&raw);
        prop_assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.'));
        prop_assert!(!name.ends_with('-'));
        prop_assert_eq!(dns_safe(&name), name.clone());
    }

    /// Property: Merged variables are unique and keep the last value.
    #[test]
    fn test_merge_env_vars_last_wins(vars in prop::collection::vec(env_var(), 0..12)) {
        let merged = envs::merge_env_vars(vars.clone());

        let mut last: HashMap<&str, &str> = HashMap::new();
        for var in &vars {
            last.insert(var.name.as_str(), var.value.as_str());
        }
        prop_assert_eq!(merged.len(), last.len());
        for var in &merged {
            prop_assert_eq!(last.get(var.name.as_str()).copied(), Some(var.value.as_str()));
        }
    }

    /// Property: Retry delays never exceed the ceiling and never shrink.
    #[test]
    fn test_backoff_bounded(failures in 1..64usize) {
        let backoff = ItemExponentialBackoff::new(Duration::from_secs(1), MAX_DELAY);
        let mut previous = Duration::ZERO;
        for _ in 0..failures {
            let delay = backoff.next_delay("ns/demo");
            prop_assert!(delay <= MAX_DELAY);
            prop_assert!(delay >= previous);
            previous = delay;
        }
    }
}
