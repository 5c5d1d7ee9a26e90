//! Ledger row types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RegistryError, Result};

/// Monotonic per-model version, rendered as `v<N>`. Numbering starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u32);

impl Version {
    pub const FIRST: Version = Version(1);

    pub fn new(n: u32) -> Self { Self(n) }
    pub fn get(self) -> u32 { self.0 }
    /// `None` once the numbering space is exhausted.
    pub fn next(self) -> Option<Self> { self.0.checked_add(1).map(Self) }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "v{}", self.0) }
}

impl FromStr for Version {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_prefix('v')
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .map(Version)
            .ok_or_else(|| RegistryError::InvalidRequest(format!("malformed version '{s}', expected v<N>")))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> { s.collect_str(self) }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One immutable registered version of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_id: String,
    pub version: Version,
    pub model_name: String,
    /// Column order the artifact was trained with.
    pub features: Vec<String>,
    pub author: String,
    /// Opaque location, resolved lazily at prediction time.
    pub artifact_pointer: String,
    pub registered_at: DateTime<Utc>,
}

/// Registration input; the version is allocated by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewModel {
    pub model_id: String,
    pub model_name: String,
    pub features: Vec<String>,
    pub author: String,
    pub artifact_pointer: String,
}

impl NewModel {
    pub fn validate(&self) -> Result<()> {
        validate_model_id(&self.model_id)?;
        if self.features.is_empty() {
            return Err(RegistryError::InvalidRecord("features must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for f in &self.features {
            if f.trim().is_empty() {
                return Err(RegistryError::InvalidRecord("feature names must not be blank".into()));
            }
            if !seen.insert(f.as_str()) {
                return Err(RegistryError::InvalidRecord(format!("duplicate feature '{f}'")));
            }
        }
        if self.artifact_pointer.trim().is_empty() {
            return Err(RegistryError::InvalidRecord("artifact_pointer must not be empty".into()));
        }
        Ok(())
    }

    pub fn into_record(self, version: Version) -> ModelRecord {
        ModelRecord {
            model_id: self.model_id,
            version,
            model_name: self.model_name,
            features: self.features,
            author: self.author,
            artifact_pointer: self.artifact_pointer,
            registered_at: Utc::now(),
        }
    }
}

/// Model ids name a directory under the artifact root, so path separators and
/// dot segments are rejected.
pub fn validate_model_id(model_id: &str) -> Result<()> {
    let ok = !model_id.is_empty()
        && model_id.len() <= 128
        && model_id != "."
        && model_id != ".."
        && model_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok { Ok(()) } else { Err(RegistryError::InvalidRecord(format!("invalid model_id '{model_id}'"))) }
}
