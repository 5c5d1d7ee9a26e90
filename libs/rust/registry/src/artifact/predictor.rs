//! Serialized regression predictors and the loader that decodes them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ArtifactError;
use crate::error::InvocationFailure;

pub const ARTIFACT_FORMAT: &str = "valuation-predictor/v1";

/// Invocable model. Rows arrive in the model's declared feature order.
pub trait Predictor: Send + Sync {
    fn n_features(&self) -> usize;

    /// One output per input row, in row order.
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, InvocationFailure>;
}

/// Turns fetched artifact bytes into a predictor.
pub trait ArtifactLoader: Send + Sync {
    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Predictor>, ArtifactError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorArtifact {
    pub format: String,
    pub n_features: usize,
    pub model: ModelSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Linear { coefficients: Vec<f64>, intercept: f64 },
    /// Mean target of the `k` nearest training points (Euclidean).
    KNeighbors { k: usize, points: Vec<Vec<f64>>, targets: Vec<f64> },
    /// Robust scaling followed by an inner estimator.
    Pipeline { scaler: RobustScaler, estimator: Box<ModelSpec> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustScaler {
    pub center: Vec<f64>,
    pub scale: Vec<f64>,
}

impl RobustScaler {
    fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.center.iter().zip(&self.scale))
            .map(|(x, (c, s))| if *s == 0.0 { x - c } else { (x - c) / s })
            .collect()
    }
}

impl PredictorArtifact {
    pub fn new(model: ModelSpec, n_features: usize) -> Self {
        Self { format: ARTIFACT_FORMAT.to_string(), n_features, model }
    }

    pub fn linear(coefficients: Vec<f64>, intercept: f64) -> Self {
        let n = coefficients.len();
        Self::new(ModelSpec::Linear { coefficients, intercept }, n)
    }
}

impl ModelSpec {
    fn check(&self, n: usize) -> Result<(), String> {
        match self {
            Self::Linear { coefficients, .. } if coefficients.len() != n => {
                Err(format!("linear model has {} coefficients for {n} features", coefficients.len()))
            }
            Self::Linear { .. } => Ok(()),
            Self::KNeighbors { k, points, targets } => {
                if *k == 0 || points.is_empty() { return Err("k_neighbors needs k >= 1 and at least one point".into()); }
                if *k > points.len() { return Err(format!("k={k} exceeds {} training points", points.len())); }
                if targets.len() != points.len() { return Err("k_neighbors targets and points differ in length".into()); }
                if let Some(bad) = points.iter().position(|p| p.len() != n) {
                    return Err(format!("training point {bad} does not have {n} features"));
                }
                Ok(())
            }
            Self::Pipeline { scaler, estimator } => {
                if scaler.center.len() != n || scaler.scale.len() != n {
                    return Err(format!("scaler is not {n} wide"));
                }
                estimator.check(n)
            }
        }
    }

    fn score(&self, row: &[f64]) -> f64 {
        match self {
            Self::Linear { coefficients, intercept } => {
                intercept + coefficients.iter().zip(row).map(|(w, x)| w * x).sum::<f64>()
            }
            Self::KNeighbors { k, points, targets } => {
                let mut dist: Vec<(f64, f64)> = points
                    .iter()
                    .zip(targets)
                    .map(|(p, t)| (p.iter().zip(row).map(|(a, b)| (a - b).powi(2)).sum::<f64>(), *t))
                    .collect();
                dist.sort_by(|a, b| a.0.total_cmp(&b.0));
                dist.iter().take(*k).map(|(_, t)| t).sum::<f64>() / *k as f64
            }
            Self::Pipeline { scaler, estimator } => estimator.score(&scaler.transform(row)),
        }
    }
}

impl Predictor for PredictorArtifact {
    fn n_features(&self) -> usize { self.n_features }

    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, InvocationFailure> {
        if let Some((row, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != self.n_features) {
            return Err(InvocationFailure::WidthMismatch { expected: self.n_features, got: r.len(), row });
        }
        Ok(rows.iter().map(|r| self.model.score(r)).collect())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonArtifactLoader;

impl ArtifactLoader for JsonArtifactLoader {
    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Predictor>, ArtifactError> {
        let artifact: PredictorArtifact = serde_json::from_slice(bytes).map_err(|e| ArtifactError::Decode(e.to_string()))?;
        if artifact.format != ARTIFACT_FORMAT {
            return Err(ArtifactError::Decode(format!("unsupported artifact format '{}'", artifact.format)));
        }
        artifact.model.check(artifact.n_features).map_err(ArtifactError::Decode)?;
        Ok(Arc::new(artifact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(json: serde_json::Value) -> Result<Arc<dyn Predictor>, ArtifactError> {
        JsonArtifactLoader.load(&serde_json::to_vec(&json).unwrap())
    }

    #[test]
    fn linear_model_scores_positionally() {
        let p = load(serde_json::json!({
            "format": ARTIFACT_FORMAT, "n_features": 2,
            "model": { "kind": "linear", "coefficients": [10.0, 1.0], "intercept": 5.0 }
        })).unwrap();
        assert_eq!(p.predict(&[vec![3.0, 100.0], vec![1.0, 0.0]]).unwrap(), vec![135.0, 15.0]);
    }

    #[test]
    fn pipeline_scales_before_estimating() {
        let art = PredictorArtifact::new(
            ModelSpec::Pipeline {
                scaler: RobustScaler { center: vec![2.0, 0.0], scale: vec![2.0, 0.0] },
                estimator: Box::new(ModelSpec::Linear { coefficients: vec![1.0, 1.0], intercept: 0.0 }),
            },
            2,
        );
        // zero scale behaves like scale 1
        assert_eq!(art.predict(&[vec![6.0, 3.0]]).unwrap(), vec![5.0]);
    }

    #[test]
    fn k_neighbors_averages_nearest_targets() {
        let art = PredictorArtifact::new(
            ModelSpec::KNeighbors { k: 2, points: vec![vec![0.0], vec![1.0], vec![10.0]], targets: vec![100.0, 200.0, 900.0] },
            1,
        );
        assert_eq!(art.predict(&[vec![0.4]]).unwrap(), vec![150.0]);
    }

    #[test]
    fn wrong_width_is_invocation_failure() {
        let art = PredictorArtifact::linear(vec![1.0, 2.0], 0.0);
        let err = art.predict(&[vec![1.0, 2.0], vec![1.0]]).unwrap_err();
        assert_eq!(err, InvocationFailure::WidthMismatch { expected: 2, got: 1, row: 1 });
    }

    #[test]
    fn foreign_format_is_rejected() {
        let err = load(serde_json::json!({
            "format": "pickle", "n_features": 1,
            "model": { "kind": "linear", "coefficients": [1.0], "intercept": 0.0 }
        }))
        .err()
        .unwrap();
        assert!(matches!(err, ArtifactError::Decode(_)));
    }

    #[test]
    fn inconsistent_dimensions_are_rejected() {
        let bad = load(serde_json::json!({
            "format": ARTIFACT_FORMAT, "n_features": 3,
            "model": { "kind": "linear", "coefficients": [1.0], "intercept": 0.0 }
        }));
        assert!(bad.is_err());
        let bad_knn = load(serde_json::json!({
            "format": ARTIFACT_FORMAT, "n_features": 1,
            "model": { "kind": "k_neighbors", "k": 3, "points": [[0.0]], "targets": [1.0] }
        }));
        assert!(bad_knn.is_err());
    }

    #[test]
    fn garbage_bytes_are_decode_errors() {
        assert!(matches!(JsonArtifactLoader.load(b"\x80\x04pickle").err().unwrap(), ArtifactError::Decode(_)));
    }
}
