//! Next-version derivation. Re-derived from the ledger on every call, never cached.
//!
//! Nothing is reserved: two writers may be handed the same version, and the
//! ledger's commit check turns the slower one into a detected conflict.

use crate::error::Result;
use crate::ledger::{Ledger, LedgerSnapshot};
use crate::record::Version;

pub struct VersionAllocator;

impl VersionAllocator {
    pub fn allocate(ledger: &Ledger, model_id: &str) -> Result<Version> {
        Self::allocate_from(&ledger.snapshot()?, model_id)
    }

    pub fn allocate_from(snapshot: &LedgerSnapshot, model_id: &str) -> Result<Version> { snapshot.next_version(model_id) }
}
