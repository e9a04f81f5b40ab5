//! Resource quota arithmetic.
//!
//! CPU and memory quantities are held as integers (millicores and bytes) so
//! that division and multiplication are exact and floor deterministically.
//! Parsing accepts the Kubernetes quantity grammar: decimal mantissas with
//! SI, binary or `e<n>` exponent suffixes.

use std::fmt;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use thiserror::Error;

use crate::config::OperatorConfig;
use crate::crd::ResQuotaPlan;

/// Maximum CPU a single process may request, in millicores.
pub const MAX_CPU_MILLIS: i64 = 4000;
/// Maximum memory a single process may request, in bytes.
pub const MAX_MEMORY_BYTES: i64 = 4096 * MIB;
/// CPU request applied to every process, in millicores.
pub const CPU_REQUEST_MILLIS: i64 = 200;
/// Memory limits at or above this use the 1/2 request ratio instead of 1/4.
pub const MEMORY_HALF_RATIO_THRESHOLD: i64 = 2048 * MIB;

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;
const TIB: i64 = 1024 * GIB;

/// Errors from parsing or validating a quantity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// The quantity is above the platform ceiling.
    #[error("{kind} quantity {raw} exceeds the limit of {max}")]
    ExceedLimit {
        kind: ResourceKind,
        raw: String,
        max: String,
    },

    /// No quantity was given.
    #[error("{0} quota is required")]
    ResQuotaRequired(ResourceKind),

    /// The quantity could not be parsed.
    #[error("invalid {kind} quantity: {raw}")]
    Parse { kind: ResourceKind, raw: String },
}

/// The resource a quantity measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// An exact CPU or memory amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quantity {
    kind: ResourceKind,
    value: i64,
}

impl Quantity {
    /// Parse and validate a quantity string such as `500m`, `0.5`, `1.5Gi`
    /// or `512e6`. Fractions of a millicore or byte round up.
    pub fn parse(raw: &str, kind: ResourceKind) -> Result<Self, QuotaError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(QuotaError::ResQuotaRequired(kind));
        }
        let value = match kind {
            ResourceKind::Cpu => parse_cpu_millis(trimmed),
            ResourceKind::Memory => parse_memory_bytes(trimmed),
        }
        .ok_or_else(|| QuotaError::Parse {
            kind,
            raw: raw.to_string(),
        })?;

        let quantity = Self { kind, value };
        let max = Self::ceiling(kind);
        if quantity.value > max.value {
            return Err(QuotaError::ExceedLimit {
                kind,
                raw: raw.to_string(),
                max: max.to_string(),
            });
        }
        Ok(quantity)
    }

    /// Build a CPU quantity from millicores.
    pub fn from_millicores(millis: i64) -> Self {
        Self {
            kind: ResourceKind::Cpu,
            value: millis.max(0),
        }
    }

    /// Build a memory quantity from bytes.
    pub fn from_bytes(bytes: i64) -> Self {
        Self {
            kind: ResourceKind::Memory,
            value: bytes.max(0),
        }
    }

    /// The largest accepted quantity of a kind.
    pub fn ceiling(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Cpu => Self::from_millicores(MAX_CPU_MILLIS),
            ResourceKind::Memory => Self::from_bytes(MAX_MEMORY_BYTES),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Raw integer value: millicores for CPU, bytes for memory.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Floor division. Division by zero or a negative divisor yields zero.
    pub fn div(&self, divisor: i64) -> Self {
        let value = if divisor <= 0 { 0 } else { self.value / divisor };
        Self {
            kind: self.kind,
            value,
        }
    }

    /// Saturating multiplication; negative factors yield zero.
    pub fn multi(&self, factor: i64) -> Self {
        let value = if factor <= 0 {
            0
        } else {
            self.value.saturating_mul(factor)
        };
        Self {
            kind: self.kind,
            value,
        }
    }

    /// Convert into the Kubernetes wire representation.
    pub fn to_k8s(&self) -> K8sQuantity {
        K8sQuantity(self.to_string())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Cpu => {
                if self.value % 1000 == 0 {
                    write!(f, "{}", self.value / 1000)
                } else {
                    write!(f, "{}m", self.value)
                }
            }
            ResourceKind::Memory => {
                let v = self.value;
                if v == 0 {
                    write!(f, "0")
                } else if v % TIB == 0 {
                    write!(f, "{}Ti", v / TIB)
                } else if v % GIB == 0 {
                    write!(f, "{}Gi", v / GIB)
                } else if v % MIB == 0 {
                    write!(f, "{}Mi", v / MIB)
                } else if v % KIB == 0 {
                    write!(f, "{}Ki", v / KIB)
                } else {
                    write!(f, "{}", v)
                }
            }
        }
    }
}

/// Millicores per core.
const MILLIS_PER_CORE: i128 = 1000;
/// Longest digit run accepted in a mantissa or implied by an exponent.
const MAX_DIGITS: u32 = 30;

fn parse_cpu_millis(raw: &str) -> Option<i64> {
    parse_scaled(raw, MILLIS_PER_CORE)
}

fn parse_memory_bytes(raw: &str) -> Option<i64> {
    parse_scaled(raw, 1)
}

/// Parse a non-negative Kubernetes quantity (`1.5Gi`, `250m`, `512e6`, ...)
/// into a count of `1/scale` base units, rounding up to a whole unit.
/// Values too large for `i64` saturate.
fn parse_scaled(raw: &str, scale: i128) -> Option<i64> {
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    let digits = format!("{whole}{frac}");
    if digits.is_empty()
        || digits.len() > MAX_DIGITS as usize
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let mantissa: i128 = digits.parse().ok()?;
    let (num, den) = suffix_ratio(suffix)?;

    let frac_len = u32::try_from(frac.len()).ok()?;
    let den = den.checked_mul(10i128.checked_pow(frac_len)?)?;
    let value = match mantissa.checked_mul(num).and_then(|v| v.checked_mul(scale)) {
        Some(numerator) => div_ceil(numerator, den),
        None => return Some(i64::MAX),
    };
    Some(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Multiplier of a quantity suffix as `numerator / denominator`.
fn suffix_ratio(suffix: &str) -> Option<(i128, i128)> {
    let ratio = match suffix {
        "" => (1, 1),
        "n" => (1, 1_000_000_000),
        "u" => (1, 1_000_000),
        "m" => (1, 1_000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => {
            let exponent: i32 = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?
                .parse()
                .ok()?;
            if exponent.unsigned_abs() > MAX_DIGITS {
                return None;
            }
            let power = 10i128.pow(exponent.unsigned_abs());
            if exponent >= 0 { (power, 1) } else { (1, power) }
        }
    };
    Some(ratio)
}

fn div_ceil(numerator: i128, divisor: i128) -> i128 {
    numerator / divisor + i128::from(numerator % divisor != 0)
}

/// CPU and memory limits of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceQuota {
    pub cpu: Quantity,
    pub memory: Quantity,
}

impl ResourceQuota {
    /// Parse a pair of limit strings.
    pub fn parse(cpu: &str, memory: &str) -> Result<Self, QuotaError> {
        Ok(Self {
            cpu: Quantity::parse(cpu, ResourceKind::Cpu)?,
            memory: Quantity::parse(memory, ResourceKind::Memory)?,
        })
    }

    /// Requests derived from the limits.
    pub fn requests(&self) -> ResourceQuota {
        ResourceQuota {
            cpu: cpu_request(),
            memory: memory_request(self.memory),
        }
    }
}

/// CPU request: a fixed 200m whatever the limit.
pub fn cpu_request() -> Quantity {
    Quantity::from_millicores(CPU_REQUEST_MILLIS)
}

/// Memory request: half the limit for large limits, a quarter otherwise.
pub fn memory_request(limit: Quantity) -> Quantity {
    if limit.value() >= MEMORY_HALF_RATIO_THRESHOLD {
        limit.div(2)
    } else {
        limit.div(4)
    }
}

/// Limits described by a named quota plan.
pub fn from_quota_plan(
    plan: ResQuotaPlan,
    config: &OperatorConfig,
) -> Result<ResourceQuota, QuotaError> {
    match plan {
        ResQuotaPlan::Default => {
            ResourceQuota::parse(&config.default_cpu_limit, &config.default_memory_limit)
        }
        ResQuotaPlan::Plan4C1G => ResourceQuota::parse("4000m", "1024Mi"),
        ResQuotaPlan::Plan4C2G => ResourceQuota::parse("4000m", "2048Mi"),
        ResQuotaPlan::Plan4C4G => ResourceQuota::parse("4000m", "4096Mi"),
    }
}
