//! Core change model

use crate::error::ValidationError;
use crate::quantity::{ResourceField, ResourceQuantities};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Confirmation token identifier
    TokenId
);
uuid_id!(
    /// Rollback snapshot identifier
    SnapshotId
);
uuid_id!(
    /// Execution transaction identifier
    TransactionId
);

/// Audit entry identifier (sortable by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditEntryId(pub Ulid);

impl fmt::Display for AuditEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one workload in one cluster
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceTarget {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl ResourceTarget {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// A Deployment in the given namespace
    pub fn deployment(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(cluster, namespace, "Deployment", name)
    }

    fn blank_part(&self) -> Option<&'static str> {
        [
            ("cluster", &self.cluster),
            ("namespace", &self.namespace),
            ("kind", &self.kind),
            ("name", &self.name),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(part, _)| part)
    }
}

impl fmt::Display for ResourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.cluster, self.namespace, self.kind, self.name)
    }
}

/// Percentage change of one field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub field: ResourceField,
    pub current: u64,
    pub proposed: u64,
    pub percent: f64,
}

impl FieldDelta {
    #[inline]
    #[must_use]
    pub fn is_increase(&self) -> bool {
        self.proposed > self.current
    }
}

/// A proposed resizing of one workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceChange {
    target: ResourceTarget,
    current: ResourceQuantities,
    proposed: ResourceQuantities,
}

impl ResourceChange {
    #[must_use]
    pub fn new(
        target: ResourceTarget,
        current: ResourceQuantities,
        proposed: ResourceQuantities,
    ) -> Self {
        Self {
            target,
            current,
            proposed,
        }
    }

    #[inline]
    #[must_use]
    pub fn target(&self) -> &ResourceTarget {
        &self.target
    }

    #[inline]
    #[must_use]
    pub fn current(&self) -> &ResourceQuantities {
        &self.current
    }

    #[inline]
    #[must_use]
    pub fn proposed(&self) -> &ResourceQuantities {
        &self.proposed
    }

    /// Check the change is well formed
    ///
    /// # Errors
    /// Returns `ValidationError` for blank target parts, an empty proposal,
    /// or proposed fields whose current value is missing or zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(part) = self.target.blank_part() {
            return Err(ValidationError::IncompleteTarget {
                target: self.target.to_string(),
                part,
            });
        }
        if self.proposed.is_empty() {
            return Err(ValidationError::NoProposedResources {
                target: self.target.to_string(),
            });
        }
        for field in self.proposed.fields() {
            match self.current.raw(field) {
                None => {
                    return Err(ValidationError::MissingCurrentValue {
                        target: self.target.to_string(),
                        field,
                    })
                }
                Some(0) => {
                    return Err(ValidationError::ZeroCurrentValue {
                        target: self.target.to_string(),
                        field,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Percentage deltas for every proposed field that has a usable
    /// current value
    #[must_use]
    pub fn deltas(&self) -> Vec<FieldDelta> {
        self.proposed
            .fields()
            .filter_map(|field| {
                let current = self.current.raw(field).filter(|c| *c > 0)?;
                let proposed = self.proposed.raw(field)?;
                #[allow(clippy::cast_precision_loss)]
                let percent = (proposed as f64 - current as f64) / current as f64 * 100.0;
                Some(FieldDelta {
                    field,
                    current,
                    proposed,
                    percent,
                })
            })
            .collect()
    }

    /// The change that undoes this one
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            target: self.target.clone(),
            current: self.proposed,
            proposed: self.current.restricted_to(&self.proposed),
        }
    }
}

/// Validate every change and reject duplicate targets
///
/// # Errors
/// Returns the first `ValidationError` found.
pub fn validate_change_set(changes: &[ResourceChange]) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for change in changes {
        change.validate()?;
        if !seen.insert(change.target()) {
            return Err(ValidationError::DuplicateTarget {
                target: change.target().to_string(),
            });
        }
    }
    Ok(())
}

/// SHA-256 over the canonical form of a change-set.
///
/// Changes are ordered by target and quantities hashed as parsed numbers,
/// so neither input order nor quantity spelling affects the result.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeSetHash(pub [u8; 32]);

impl ChangeSetHash {
    #[must_use]
    pub fn of(changes: &[ResourceChange]) -> Self {
        let mut ordered: Vec<&ResourceChange> = changes.iter().collect();
        ordered.sort_by(|a, b| a.target.cmp(&b.target));

        let mut hasher = Sha256::new();
        hasher.update((ordered.len() as u64).to_le_bytes());
        for change in ordered {
            for part in [
                &change.target.cluster,
                &change.target.namespace,
                &change.target.kind,
                &change.target.name,
            ] {
                hasher.update(part.as_bytes());
                hasher.update([0]);
            }
            for quantities in [&change.current, &change.proposed] {
                for field in ResourceField::ALL {
                    hasher.update([field.tag()]);
                    match quantities.raw(field) {
                        Some(value) => {
                            hasher.update([1]);
                            hasher.update(value.to_le_bytes());
                        }
                        None => hasher.update([0]),
                    }
                }
            }
        }
        Self(hasher.finalize().into())
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChangeSetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChangeSetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeSetHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for ChangeSetHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl Serialize for ChangeSetHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChangeSetHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
