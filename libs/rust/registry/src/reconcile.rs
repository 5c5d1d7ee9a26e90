//! Feature reconciliation: merge a request with reference attributes, check it
//! against a model's declared features and project it into that exact order.
//!
//! Pure with respect to its inputs. On a name collision the request value wins
//! over the reference value.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};
use crate::reference::ReferenceData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl AttributeValue {
    /// CSV cell: number when it parses as one, text otherwise.
    pub fn parse_cell(raw: &str) -> Self {
        raw.parse::<f64>().map(Self::Number).unwrap_or_else(|_| Self::Text(raw.to_string()))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(n: f64) -> Self { Self::Number(n) }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self { Self::Text(s.to_string()) }
}

pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Transient prediction input: caller attributes plus the join key value.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    join_value: String,
    attributes: AttributeMap,
}

impl PredictionRequest {
    /// `attributes` may or may not already carry the join key; it is kept as text either way.
    pub fn new(join_key: &str, join_value: impl Into<String>, mut attributes: AttributeMap) -> Self {
        let join_value = join_value.into();
        attributes.insert(join_key.to_string(), AttributeValue::Text(join_value.clone()));
        Self { join_value, attributes }
    }

    /// Build from a JSON object. The join key must be a JSON string: a numeric
    /// postal code would already have lost its leading zeros.
    pub fn from_json(object: serde_json::Map<String, serde_json::Value>, join_key: &str) -> Result<Self> {
        use serde_json::Value;
        let join_value = match object.get(join_key) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => return Err(RegistryError::InvalidRequest(format!("'{join_key}' must not be blank"))),
            Some(_) => return Err(RegistryError::InvalidRequest(format!("'{join_key}' must be a string"))),
            None => return Err(RegistryError::InvalidRequest(format!("'{join_key}' is required"))),
        };
        let mut attributes = AttributeMap::new();
        for (name, value) in object {
            let v = match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(AttributeValue::Number)
                    .ok_or_else(|| RegistryError::InvalidRequest(format!("'{name}' is not a finite number")))?,
                Value::String(s) => AttributeValue::Text(s),
                other => {
                    return Err(RegistryError::InvalidRequest(format!(
                        "'{name}' must be a number or string, got {}",
                        json_type(&other)
                    )))
                }
            };
            attributes.insert(name, v);
        }
        Ok(Self { join_value, attributes })
    }

    /// A single JSON object or a non-empty array of objects, in row order.
    pub fn from_json_rows(body: serde_json::Value, join_key: &str) -> Result<Vec<Self>> {
        match body {
            serde_json::Value::Object(obj) => Ok(vec![Self::from_json(obj, join_key)?]),
            serde_json::Value::Array(rows) if rows.is_empty() => {
                Err(RegistryError::InvalidRequest("at least one prediction row is required".into()))
            }
            serde_json::Value::Array(rows) => rows
                .into_iter()
                .enumerate()
                .map(|(i, row)| match row {
                    serde_json::Value::Object(obj) => Self::from_json(obj, join_key).map_err(|e| e.at_row(i)),
                    other => Err(RegistryError::InvalidRequest(format!("row {i}: expected an object, got {}", json_type(&other)))),
                })
                .collect(),
            other => Err(RegistryError::InvalidRequest(format!("expected an object or array, got {}", json_type(&other)))),
        }
    }

    pub fn join_value(&self) -> &str { &self.join_value }
    pub fn attributes(&self) -> &AttributeMap { &self.attributes }
}

fn json_type(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
    }
}

/// Values in the model's declared feature order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledFeatureVector {
    names: Vec<String>,
    values: Vec<f64>,
}

impl ReconciledFeatureVector {
    pub fn names(&self) -> &[String] { &self.names }
    pub fn values(&self) -> &[f64] { &self.values }
    pub fn into_values(self) -> Vec<f64> { self.values }
    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }
}

/// Request attributes take precedence over reference attributes of the same name.
pub fn merge(request: &AttributeMap, reference: AttributeMap) -> AttributeMap {
    let mut merged = reference;
    for (k, v) in request {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Every declared feature absent from `merged`, in declared order.
pub fn missing_features(features: &[String], merged: &AttributeMap) -> Vec<String> {
    features.iter().filter(|f| !merged.contains_key(f.as_str())).cloned().collect()
}

/// Project `merged` onto `features`, dropping extra attributes.
pub fn project(features: &[String], merged: &AttributeMap) -> Result<ReconciledFeatureVector> {
    let missing = missing_features(features, merged);
    if !missing.is_empty() {
        return Err(RegistryError::MissingFeatures { missing, row: None });
    }
    let values = features
        .iter()
        .map(|f| merged[f.as_str()].as_number().ok_or_else(|| RegistryError::InvalidFeatureValue { feature: f.clone(), row: None }))
        .collect::<Result<Vec<f64>>>()?;
    Ok(ReconciledFeatureVector { names: features.to_vec(), values })
}

#[derive(Clone)]
pub struct FeatureReconciler {
    reference: Arc<dyn ReferenceData>,
}

impl FeatureReconciler {
    pub fn new(reference: Arc<dyn ReferenceData>) -> Self { Self { reference } }

    pub fn join_key(&self) -> &str { self.reference.join_key() }

    pub fn reconcile(&self, request: &PredictionRequest, features: &[String]) -> Result<ReconciledFeatureVector> {
        let reference = self.reference.lookup(request.join_value()).ok_or_else(|| RegistryError::ReferenceDataNotFound {
            join_key: self.reference.join_key().to_string(),
            key: request.join_value().to_string(),
        })?;
        let merged = merge(request.attributes(), reference);
        project(features, &merged)
    }

    /// Reconcile rows independently; the first failure is reported with its row index.
    pub fn reconcile_batch(&self, requests: &[PredictionRequest], features: &[String]) -> Result<Vec<ReconciledFeatureVector>> {
        requests
            .iter()
            .enumerate()
            .map(|(i, r)| self.reconcile(r, features).map_err(|e| e.at_row(i)))
            .collect()
    }
}
