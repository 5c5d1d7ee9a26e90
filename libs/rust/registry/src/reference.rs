//! Side-loaded reference attributes keyed by a join key (e.g. a zipcode).

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::{RegistryError, Result};
use crate::reconcile::{AttributeMap, AttributeValue};

pub trait ReferenceData: Send + Sync {
    /// Name of the join attribute, e.g. `zipcode`.
    fn join_key(&self) -> &str;

    /// Attributes for `key`, never including the join key itself. `None` when unknown.
    fn lookup(&self, key: &str) -> Option<AttributeMap>;
}

/// In-memory table. Keys are matched verbatim: `"01234"` and `"1234"` are different.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    join_key: String,
    rows: HashMap<String, AttributeMap>,
}

impl ReferenceTable {
    pub fn new(join_key: impl Into<String>) -> Self { Self { join_key: join_key.into(), rows: HashMap::new() } }

    pub fn insert(&mut self, key: impl Into<String>, mut attrs: AttributeMap) {
        attrs.remove(&self.join_key);
        self.rows.insert(key.into(), attrs);
    }

    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    /// Header row plus comma-separated rows. The join-key column stays a string;
    /// other cells become numbers when they parse as such. Quoted cells are not supported.
    pub fn from_csv_str(text: &str, join_key: &str) -> Result<Self> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, header) = lines.next().ok_or_else(|| RegistryError::ReferenceUnavailable("reference data is empty".into()))?;
        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        let key_col = columns
            .iter()
            .position(|c| *c == join_key)
            .ok_or_else(|| RegistryError::ReferenceUnavailable(format!("reference data has no '{join_key}' column")))?;
        let mut table = Self::new(join_key);
        for (lineno, line) in lines {
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            if cells.len() != columns.len() {
                return Err(RegistryError::ReferenceUnavailable(format!(
                    "reference data line {} has {} cells, expected {}",
                    lineno + 1,
                    cells.len(),
                    columns.len()
                )));
            }
            let attrs: AttributeMap = columns
                .iter()
                .zip(&cells)
                .enumerate()
                .filter(|(i, _)| *i != key_col)
                .map(|(_, (c, v))| (c.to_string(), AttributeValue::parse_cell(v)))
                .collect();
            table.insert(cells[key_col], attrs);
        }
        Ok(table)
    }

    pub fn from_csv_file(path: &Path, join_key: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::ReferenceUnavailable(format!("reading reference data {}: {e}", path.display())))?;
        let table = Self::from_csv_str(&text, join_key)?;
        info!(path = %path.display(), rows = table.len(), join_key, "reference data loaded");
        Ok(table)
    }
}

impl ReferenceData for ReferenceTable {
    fn join_key(&self) -> &str { &self.join_key }

    fn lookup(&self, key: &str) -> Option<AttributeMap> { self.rows.get(key).cloned() }
}
