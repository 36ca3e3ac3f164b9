//! Kubernetes resource quantities.
//!
//! CPU is held in millicores and memory in bytes. Both parse the usual
//! notations (`250m`, `0.5`, `128Mi`, `1G`) and render back to the shortest
//! exact form, so `0.25` and `250m` compare equal.

use crate::error::QuantityError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CPU quantity in millicores
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CpuQuantity(u64);

impl CpuQuantity {
    #[inline]
    #[must_use]
    pub const fn from_millicores(millicores: u64) -> Self {
        Self(millicores)
    }

    #[inline]
    #[must_use]
    pub const fn millicores(self) -> u64 {
        self.0
    }
}

impl FromStr for CpuQuantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || QuantityError {
            unit: "cpu",
            value: s.to_string(),
        };
        let trimmed = s.trim();
        let value = match trimmed.strip_suffix('m') {
            Some(milli) => scaled(milli, 1),
            None => scaled(trimmed, 1000),
        };
        value.map(Self).ok_or_else(err)
    }
}

impl fmt::Display for CpuQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl TryFrom<String> for CpuQuantity {
    type Error = QuantityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CpuQuantity> for String {
    fn from(value: CpuQuantity) -> Self {
        value.to_string()
    }
}

const BINARY_SUFFIXES: [(&str, u64); 5] = [
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

const DECIMAL_SUFFIXES: [(&str, u64); 5] = [
    ("P", 1_000_000_000_000_000),
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("k", 1_000),
];

/// Memory quantity in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryQuantity(u64);

impl MemoryQuantity {
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn from_mebibytes(mebibytes: u64) -> Self {
        Self(mebibytes << 20)
    }

    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for MemoryQuantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || QuantityError {
            unit: "memory",
            value: s.to_string(),
        };
        let trimmed = s.trim();
        let binary = BINARY_SUFFIXES
            .iter()
            .find_map(|(suffix, scale)| trimmed.strip_suffix(suffix).map(|n| (n, *scale)));
        let (number, scale) = binary
            .or_else(|| {
                DECIMAL_SUFFIXES
                    .iter()
                    .find_map(|(suffix, scale)| trimmed.strip_suffix(suffix).map(|n| (n, *scale)))
            })
            .or_else(|| trimmed.strip_suffix('K').map(|n| (n, 1_000)))
            .unwrap_or((trimmed, 1));
        scaled(number, scale).map(Self).ok_or_else(err)
    }
}

impl fmt::Display for MemoryQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0");
        }
        for (suffix, scale) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
            if self.0 % scale == 0 {
                return write!(f, "{}{suffix}", self.0 / scale);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for MemoryQuantity {
    type Error = QuantityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemoryQuantity> for String {
    fn from(value: MemoryQuantity) -> Self {
        value.to_string()
    }
}

/// Parse a non-negative decimal and multiply by `scale`, truncating
/// anything finer than one unit.
fn scaled(number: &str, scale: u64) -> Option<u64> {
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole_value: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut value = whole_value.checked_mul(scale)?;
    if !frac.is_empty() {
        let digits = &frac[..frac.len().min(18)];
        let numerator: u128 = digits.parse().ok()?;
        let denominator = 10u128.pow(u32::try_from(digits.len()).ok()?);
        let part = numerator * u128::from(scale) / denominator;
        value = value.checked_add(u64::try_from(part).ok()?)?;
    }
    Some(value)
}

/// One of the four sizing fields of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceField {
    CpuRequest,
    CpuLimit,
    MemoryRequest,
    MemoryLimit,
}

impl ResourceField {
    pub const ALL: [Self; 4] = [
        Self::CpuRequest,
        Self::CpuLimit,
        Self::MemoryRequest,
        Self::MemoryLimit,
    ];

    #[inline]
    #[must_use]
    pub fn is_cpu(self) -> bool {
        matches!(self, Self::CpuRequest | Self::CpuLimit)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CpuRequest => "cpu_request",
            Self::CpuLimit => "cpu_limit",
            Self::MemoryRequest => "memory_request",
            Self::MemoryLimit => "memory_limit",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::CpuRequest => 1,
            Self::CpuLimit => 2,
            Self::MemoryRequest => 3,
            Self::MemoryLimit => 4,
        }
    }
}

impl fmt::Display for ResourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests and limits of one workload container. Absent fields are
/// left untouched by a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceQuantities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<CpuQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<CpuQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<MemoryQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<MemoryQuantity>,
}

impl ResourceQuantities {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_cpu_request(mut self, value: CpuQuantity) -> Self {
        self.cpu_request = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_cpu_limit(mut self, value: CpuQuantity) -> Self {
        self.cpu_limit = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_memory_request(mut self, value: MemoryQuantity) -> Self {
        self.memory_request = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_memory_limit(mut self, value: MemoryQuantity) -> Self {
        self.memory_limit = Some(value);
        self
    }

    /// Raw numeric value of a field (millicores or bytes)
    #[must_use]
    pub fn raw(&self, field: ResourceField) -> Option<u64> {
        match field {
            ResourceField::CpuRequest => self.cpu_request.map(CpuQuantity::millicores),
            ResourceField::CpuLimit => self.cpu_limit.map(CpuQuantity::millicores),
            ResourceField::MemoryRequest => self.memory_request.map(MemoryQuantity::bytes),
            ResourceField::MemoryLimit => self.memory_limit.map(MemoryQuantity::bytes),
        }
    }

    /// Field rendered in Kubernetes notation
    #[must_use]
    pub fn display(&self, field: ResourceField) -> Option<String> {
        match field {
            ResourceField::CpuRequest => self.cpu_request.map(|q| q.to_string()),
            ResourceField::CpuLimit => self.cpu_limit.map(|q| q.to_string()),
            ResourceField::MemoryRequest => self.memory_request.map(|q| q.to_string()),
            ResourceField::MemoryLimit => self.memory_limit.map(|q| q.to_string()),
        }
    }

    /// Fields that carry a value
    pub fn fields(&self) -> impl Iterator<Item = ResourceField> + '_ {
        ResourceField::ALL
            .into_iter()
            .filter(|field| self.raw(*field).is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields().next().is_none()
    }

    /// Keep only the fields that `mask` sets
    #[must_use]
    pub fn restricted_to(&self, mask: &ResourceQuantities) -> Self {
        Self {
            cpu_request: mask.cpu_request.and(self.cpu_request),
            cpu_limit: mask.cpu_limit.and(self.cpu_limit),
            memory_request: mask.memory_request.and(self.memory_request),
            memory_limit: mask.memory_limit.and(self.memory_limit),
        }
    }

    /// True when every field set in `expected` has the same value here
    #[must_use]
    pub fn satisfies(&self, expected: &ResourceQuantities) -> bool {
        expected
            .fields()
            .all(|field| self.raw(field) == expected.raw(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cpu_notations() {
        assert_eq!("250m".parse::<CpuQuantity>().unwrap().millicores(), 250);
        assert_eq!("0.25".parse::<CpuQuantity>().unwrap().millicores(), 250);
        assert_eq!("2".parse::<CpuQuantity>().unwrap().millicores(), 2000);
        assert_eq!("1.5".parse::<CpuQuantity>().unwrap().to_string(), "1500m");
        assert_eq!(CpuQuantity::from_millicores(3000).to_string(), "3");
        assert!("abc".parse::<CpuQuantity>().is_err());
        assert!("-1".parse::<CpuQuantity>().is_err());
        assert!("".parse::<CpuQuantity>().is_err());
    }

    #[test]
    fn memory_notations() {
        assert_eq!("128Mi".parse::<MemoryQuantity>().unwrap().bytes(), 128 << 20);
        assert_eq!("1Gi".parse::<MemoryQuantity>().unwrap().bytes(), 1 << 30);
        assert_eq!("512Ki".parse::<MemoryQuantity>().unwrap().bytes(), 512 << 10);
        assert_eq!("1G".parse::<MemoryQuantity>().unwrap().bytes(), 1_000_000_000);
        assert_eq!("1.5Gi".parse::<MemoryQuantity>().unwrap().bytes(), 3 << 29);
        assert_eq!("1048576".parse::<MemoryQuantity>().unwrap().to_string(), "1Mi");
        assert_eq!("500M".parse::<MemoryQuantity>().unwrap().to_string(), "500M");
        assert!("12Qi".parse::<MemoryQuantity>().is_err());
    }

    #[test]
    fn serde_uses_kubernetes_strings() {
        let q = ResourceQuantities::new()
            .with_cpu_request(CpuQuantity::from_millicores(100))
            .with_memory_limit(MemoryQuantity::from_mebibytes(256));
        let json = serde_json::to_value(q).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"cpu_request": "100m", "memory_limit": "256Mi"})
        );
        let back: ResourceQuantities =
            serde_json::from_value(serde_json::json!({"cpu_request": "0.1"})).unwrap();
        assert_eq!(back.cpu_request, q.cpu_request);
    }

    #[test]
    fn restriction_and_satisfaction() {
        let live = ResourceQuantities::new()
            .with_cpu_request(CpuQuantity::from_millicores(100))
            .with_cpu_limit(CpuQuantity::from_millicores(500));
        let mask = ResourceQuantities::new().with_cpu_request(CpuQuantity::from_millicores(1));
        let only = live.restricted_to(&mask);
        assert_eq!(only.cpu_limit, None);
        assert!(live.satisfies(&only));
        assert!(!live.satisfies(&mask));
    }
}
