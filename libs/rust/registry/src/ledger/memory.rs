use parking_lot::RwLock;

use super::{BeforeWrite, LedgerSnapshot, LedgerStore, Revision};
use crate::error::Result;
use crate::record::ModelRecord;

/// Process-local ledger. Commits are serialised by the write lock.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: RwLock<LedgerSnapshot>,
}

impl LedgerStore for MemoryLedger {
    fn snapshot(&self) -> Result<LedgerSnapshot> { Ok(self.inner.read().clone()) }

    fn commit_with(&self, record: ModelRecord, before_write: BeforeWrite<'_>) -> Result<Revision> {
        let mut w = self.inner.write();
        w.check_commit(&record)?;
        before_write(&record)?;
        w.records.push(record);
        w.revision += 1;
        Ok(w.revision)
    }

    fn describe(&self) -> String { "memory".into() }
}
