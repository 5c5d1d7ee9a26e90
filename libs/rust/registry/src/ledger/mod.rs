//! Registry ledger: the source of truth for which versions exist.
//!
//! Every write is a compare-and-swap on the model's head: a record commits only
//! if its version is exactly the next one for that model at commit time, so
//! writers of unrelated models never collide. Backends must make a commit
//! visible all at once; readers never see a partially written record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::record::{ModelRecord, Version};

mod file;
mod memory;

pub use file::{FileLedger, FileLedgerOptions};
pub use memory::MemoryLedger;

/// Count of commits applied to a ledger. Bumps by one per append.
pub type Revision = u64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub revision: Revision,
    #[serde(default)]
    pub records: Vec<ModelRecord>,
}

impl LedgerSnapshot {
    /// Highest version for `model_id`, independent of row order.
    pub fn latest(&self, model_id: &str) -> Option<&ModelRecord> {
        self.records.iter().filter(|r| r.model_id == model_id).max_by_key(|r| r.version)
    }

    pub fn get(&self, model_id: &str, version: Version) -> Option<&ModelRecord> {
        self.records.iter().find(|r| r.model_id == model_id && r.version == version)
    }

    /// Ascending.
    pub fn versions(&self, model_id: &str) -> Vec<Version> {
        let mut out: Vec<Version> = self.records.iter().filter(|r| r.model_id == model_id).map(|r| r.version).collect();
        out.sort_unstable();
        out
    }

    /// Latest record of every model, ordered by model id.
    pub fn models(&self) -> Vec<&ModelRecord> {
        let mut ids: Vec<&str> = self.records.iter().map(|r| r.model_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().filter_map(|id| self.latest(id)).collect()
    }

    /// `v1` for a fresh id, otherwise `max + 1`. Gaps are kept, numbers never reused.
    pub fn next_version(&self, model_id: &str) -> Result<Version> {
        match self.latest(model_id) {
            None => Ok(Version::FIRST),
            Some(head) => head
                .version
                .next()
                .ok_or_else(|| RegistryError::Storage(format!("model '{model_id}' has exhausted its version numbers"))),
        }
    }

    /// Shared commit precondition for all backends.
    pub(crate) fn check_commit(&self, record: &ModelRecord) -> Result<()> {
        let next = self.next_version(&record.model_id)?;
        if record.version != next {
            debug!(model_id = %record.model_id, version = %record.version, %next, "commit rejected");
            return Err(RegistryError::Conflict { model_id: record.model_id.clone(), version: record.version });
        }
        Ok(())
    }
}

/// Runs inside a commit after the precondition holds and before the record is
/// visible. An error aborts the commit.
pub type BeforeWrite<'a> = &'a mut dyn FnMut(&ModelRecord) -> Result<()>;

/// Storage backend contract.
pub trait LedgerStore: Send + Sync {
    /// Full consistent view of the ledger.
    fn snapshot(&self) -> Result<LedgerSnapshot>;

    /// Append `record` only if its version is the model's next version at commit
    /// time; otherwise `RegistryError::Conflict`. Commits are serialised, and
    /// `before_write` runs inside that critical section.
    fn commit_with(&self, record: ModelRecord, before_write: BeforeWrite<'_>) -> Result<Revision>;

    fn commit(&self, record: ModelRecord) -> Result<Revision> { self.commit_with(record, &mut |_| Ok(())) }

    fn describe(&self) -> String;
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("store", &self.store.describe()).finish()
    }
}

impl Ledger {
    pub fn new(store: impl LedgerStore + 'static) -> Self { Self { store: Arc::new(store) } }

    pub fn in_memory() -> Self { Self::new(MemoryLedger::default()) }

    pub fn snapshot(&self) -> Result<LedgerSnapshot> { self.store.snapshot() }

    /// Conflicts if the model has moved past `record.version - 1` since it was allocated.
    pub fn append(&self, record: ModelRecord) -> Result<Revision> { self.store.commit(record) }

    /// Like [`Ledger::append`], running `before_write` once the commit is certain
    /// to succeed but before readers can see the record.
    pub fn append_with(&self, record: ModelRecord, before_write: BeforeWrite<'_>) -> Result<Revision> {
        self.store.commit_with(record, before_write)
    }

    /// `Ok(None)` when the model has never been registered.
    pub fn latest(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        Ok(self.store.snapshot()?.latest(model_id).cloned())
    }

    pub fn versions(&self, model_id: &str) -> Result<Vec<Version>> {
        Ok(self.store.snapshot()?.versions(model_id))
    }

    pub fn models(&self) -> Result<Vec<ModelRecord>> {
        Ok(self.store.snapshot()?.models().into_iter().cloned().collect())
    }

    pub fn describe(&self) -> String { self.store.describe() }
}


#[cfg(test)]
mod tests {
    use super::test_support::record;
    use super::*;

    #[test]
    fn latest_is_highest_version_not_last_row() {
        let snap = LedgerSnapshot {
            revision: 3,
            records: vec![record("m", 1, &["a"]), record("m", 3, &["a", "b"]), record("m", 2, &["a"])],
        };
        assert_eq!(snap.latest("m").unwrap().version, Version::new(3));
        assert_eq!(snap.versions("m"), vec![Version::new(1), Version::new(2), Version::new(3)]);
        assert!(snap.latest("other").is_none());
    }

    #[test]
    fn append_rejects_duplicate_pair() {
        let ledger = Ledger::in_memory();
        ledger.append(record("m", 1, &["a"])).unwrap();
        let err = ledger.append(record("m", 1, &["a"])).unwrap_err();
        assert_eq!(err.code(), "REGISTRATION_CONFLICT");
    }

    #[test]
    fn append_must_extend_the_model_head() {
        let ledger = Ledger::in_memory();
        let err = ledger.append(record("m", 2, &["a"])).unwrap_err();
        assert!(err.is_retryable());
        ledger.append(record("m", 1, &["a"])).unwrap();
        ledger.append(record("m", 2, &["a"])).unwrap();
    }

    #[test]
    fn unrelated_models_never_conflict() {
        let ledger = Ledger::in_memory();
        let next_m = ledger.snapshot().unwrap().next_version("m").unwrap();
        ledger.append(record("other", 1, &["a"])).unwrap();
        ledger.append(record("other", 2, &["a"])).unwrap();
        assert_eq!(ledger.append(record("m", next_m.get(), &["a"])).unwrap(), 3);
    }

    #[test]
    fn exhausted_numbering_is_an_error_not_a_reissue() {
        let snap = LedgerSnapshot { revision: 1, records: vec![record("m", u32::MAX, &["a"])] };
        assert_eq!(snap.next_version("m").unwrap_err().code(), "LEDGER_UNAVAILABLE");
        assert_eq!(snap.next_version("other").unwrap(), Version::FIRST);
    }

    #[test]
    fn failing_before_write_aborts_the_commit() {
        let ledger = Ledger::in_memory();
        let err = ledger
            .append_with(record("m", 1, &["a"]), &mut |_| Err(RegistryError::Storage("bundle".into())))
            .unwrap_err();
        assert_eq!(err.code(), "LEDGER_UNAVAILABLE");
        assert!(ledger.versions("m").unwrap().is_empty());

        let mut seen = Vec::new();
        ledger.append_with(record("m", 1, &["a"]), &mut |r| { seen.push(r.version); Ok(()) }).unwrap();
        assert_eq!(seen, vec![Version::FIRST]);
    }

    #[test]
    fn latest_distinguishes_absent_model() {
        let ledger = Ledger::in_memory();
        assert!(ledger.latest("nope").unwrap().is_none());
        assert!(ledger.versions("nope").unwrap().is_empty());
    }

    #[test]
    fn models_lists_latest_per_id() {
        let ledger = Ledger::in_memory();
        ledger.append(record("b", 1, &["x"])).unwrap();
        ledger.append(record("a", 1, &["x"])).unwrap();
        ledger.append(record("a", 2, &["x"])).unwrap();
        let models = ledger.models().unwrap();
        let summary: Vec<_> = models.iter().map(|r| (r.model_id.as_str(), r.version.get())).collect();
        assert_eq!(summary, vec![("a", 2), ("b", 1)]);
    }
}
