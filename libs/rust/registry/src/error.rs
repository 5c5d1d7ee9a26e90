use thiserror::Error;

use crate::record::Version;

/// Coarse error class, used by the boundary to pick a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown model id, version or join key. Client input.
    NotFound,
    /// The request or record does not satisfy the model's schema. Client input.
    Validation,
    /// Lost a registration race. Retryable by the caller.
    Conflict,
    /// Artifact or predictor failure. Needs an operator.
    Dependency,
    /// Ledger backing store unreadable or unwritable.
    Storage,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no model found with id '{model_id}'")]
    ModelNotFound { model_id: String },

    #[error("model '{model_id}' has no version {version}")]
    VersionNotFound { model_id: String, version: Version },

    #[error("no reference data found for {join_key} '{key}'")]
    ReferenceDataNotFound { join_key: String, key: String },

    #[error("missing required features{}: {missing:?}", row_suffix(.row))]
    MissingFeatures { missing: Vec<String>, row: Option<usize> },

    #[error("feature '{feature}' must be numeric{}", row_suffix(.row))]
    InvalidFeatureValue { feature: String, row: Option<usize> },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid model record: {0}")]
    InvalidRecord(String),

    #[error("registration conflict on model '{model_id}' version {version}")]
    Conflict { model_id: String, version: Version },

    #[error("failed to load artifact for '{model_id}' {version}: {reason}")]
    ArtifactLoad { model_id: String, version: Version, reason: String },

    #[error("predictor for '{model_id}' {version} failed: {source}")]
    Invocation {
        model_id: String,
        version: Version,
        #[source]
        source: InvocationFailure,
    },

    #[error("ledger unavailable: {0}")]
    Storage(String),

    #[error("reference data unavailable: {0}")]
    ReferenceUnavailable(String),
}

/// Raised by a predictor while scoring rows.
#[derive(Debug, Error, PartialEq)]
pub enum InvocationFailure {
    #[error("expected {expected} features per row, got {got} (row {row})")]
    WidthMismatch { expected: usize, got: usize, row: usize },
    #[error("predictor produced {got} outputs for {expected} rows")]
    OutputCount { expected: usize, got: usize },
    #[error("{0}")]
    Model(String),
}

fn row_suffix(row: &Option<usize>) -> String {
    row.map(|r| format!(" (row {r})")).unwrap_or_default()
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelNotFound { .. } | Self::VersionNotFound { .. } | Self::ReferenceDataNotFound { .. } => ErrorKind::NotFound,
            Self::MissingFeatures { .. } | Self::InvalidFeatureValue { .. } | Self::InvalidRequest(_) | Self::InvalidRecord(_) => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::ArtifactLoad { .. } | Self::Invocation { .. } => ErrorKind::Dependency,
            Self::Storage(_) | Self::ReferenceUnavailable(_) => ErrorKind::Storage,
        }
    }

    /// Stable code surfaced to callers. Never rename an existing code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            Self::VersionNotFound { .. } => "VERSION_NOT_FOUND",
            Self::ReferenceDataNotFound { .. } => "REFERENCE_DATA_NOT_FOUND",
            Self::MissingFeatures { .. } => "MISSING_FEATURES",
            Self::InvalidFeatureValue { .. } => "INVALID_FEATURE_VALUE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidRecord(_) => "INVALID_RECORD",
            Self::Conflict { .. } => "REGISTRATION_CONFLICT",
            Self::ArtifactLoad { .. } => "ARTIFACT_LOAD_ERROR",
            Self::Invocation { .. } => "INVOCATION_ERROR",
            Self::Storage(_) => "LEDGER_UNAVAILABLE",
            Self::ReferenceUnavailable(_) => "REFERENCE_DATA_UNAVAILABLE",
        }
    }

    pub fn is_retryable(&self) -> bool { matches!(self, Self::Conflict { .. }) }

    /// Offending identifiers for machine consumption.
    pub fn details(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Self::ModelNotFound { model_id } => json!({ "model_id": model_id }),
            Self::VersionNotFound { model_id, version } => json!({ "model_id": model_id, "version": version }),
            Self::ReferenceDataNotFound { join_key, key } => json!({ "join_key": join_key, "key": key }),
            Self::MissingFeatures { missing, row } => json!({ "missing": missing, "row": row }),
            Self::InvalidFeatureValue { feature, row } => json!({ "feature": feature, "row": row }),
            Self::Conflict { model_id, version } => json!({ "model_id": model_id, "version": version }),
            Self::ArtifactLoad { model_id, version, .. } | Self::Invocation { model_id, version, .. } => json!({ "model_id": model_id, "version": version }),
            Self::InvalidRequest(_) | Self::InvalidRecord(_) | Self::Storage(_) | Self::ReferenceUnavailable(_) => serde_json::Value::Null,
        }
    }

    /// Attach a batch row index to row-scoped validation failures.
    pub fn at_row(self, index: usize) -> Self {
        match self {
            Self::MissingFeatures { missing, .. } => Self::MissingFeatures { missing, row: Some(index) },
            Self::InvalidFeatureValue { feature, .. } => Self::InvalidFeatureValue { feature, row: Some(index) },
            Self::InvalidRequest(msg) => Self::InvalidRequest(format!("row {index}: {msg}")),
            other => other,
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(e: std::io::Error) -> Self { Self::Storage(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_per_failure_kind() {
        let v = Version::new(1);
        let errs = vec![
            RegistryError::ModelNotFound { model_id: "m".into() },
            RegistryError::ReferenceDataNotFound { join_key: "zipcode".into(), key: "00000".into() },
            RegistryError::MissingFeatures { missing: vec!["a".into()], row: None },
            RegistryError::ArtifactLoad { model_id: "m".into(), version: v, reason: "gone".into() },
            RegistryError::Invocation { model_id: "m".into(), version: v, source: InvocationFailure::Model("nan".into()) },
        ];
        let mut codes: Vec<_> = errs.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 5);
    }

    #[test]
    fn missing_features_message_names_every_feature() {
        let e = RegistryError::MissingFeatures { missing: vec!["sqft_living".into(), "income".into()], row: None };
        let msg = e.to_string();
        assert!(msg.contains("sqft_living") && msg.contains("income"));
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert_eq!(e.details()["missing"], serde_json::json!(["sqft_living", "income"]));
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(RegistryError::Conflict { model_id: "m".into(), version: Version::new(2) }.is_retryable());
        assert!(!RegistryError::Storage("disk".into()).is_retryable());
    }

    #[test]
    fn row_index_is_attached() {
        let e = RegistryError::MissingFeatures { missing: vec!["a".into()], row: None }.at_row(3);
        assert!(e.to_string().contains("(row 3)"));
    }
}
