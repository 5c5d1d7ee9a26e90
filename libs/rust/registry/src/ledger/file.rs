//! JSON-document ledger on a shared filesystem.
//!
//! Writers from any process serialise on an exclusive `<ledger>.lock` file, re-read
//! the document under the lock, check the expected revision and rewrite the whole
//! document through a temp file + rename. Readers take no lock.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{BeforeWrite, LedgerSnapshot, LedgerStore, Revision};
use crate::error::{RegistryError, Result};
use crate::record::ModelRecord;

#[derive(Debug, Clone)]
pub struct FileLedgerOptions {
    /// How long a writer waits for the lock before giving up.
    pub lock_timeout: Duration,
    /// A lock file older than this is assumed orphaned by a crashed writer.
    pub stale_lock_after: Duration,
    pub poll_interval: Duration,
}

impl Default for FileLedgerOptions {
    fn default() -> Self {
        Self { lock_timeout: Duration::from_secs(5), stale_lock_after: Duration::from_secs(30), poll_interval: Duration::from_millis(5) }
    }
}

pub struct FileLedger {
    path: PathBuf,
    lock_path: PathBuf,
    opts: FileLedgerOptions,
    local: Mutex<()>,
}

impl FileLedger {
    pub fn open(path: impl Into<PathBuf>, opts: FileLedgerOptions) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        info!(ledger = %path.display(), "file ledger opened");
        Ok(Self { path, lock_path, opts, local: Mutex::new(()) })
    }

    fn read(&self) -> Result<LedgerSnapshot> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(LedgerSnapshot::default()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| RegistryError::Storage(format!("corrupt ledger {}: {e}", self.path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LedgerSnapshot::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl LedgerStore for FileLedger {
    fn snapshot(&self) -> Result<LedgerSnapshot> { self.read() }

    fn commit_with(&self, record: ModelRecord, before_write: BeforeWrite<'_>) -> Result<Revision> {
        let _local = self.local.lock();
        let _lock = LockFile::acquire(&self.lock_path, &self.opts)?;
        let mut snap = self.read()?;
        snap.check_commit(&record)?;
        before_write(&record)?;
        let (model_id, version) = (record.model_id.clone(), record.version);
        snap.records.push(record);
        snap.revision += 1;
        let bytes = serde_json::to_vec_pretty(&snap).map_err(|e| RegistryError::Storage(e.to_string()))?;
        write_atomic(&self.path, &bytes)?;
        debug!(%model_id, %version, revision = snap.revision, "ledger committed");
        Ok(snap.revision)
    }

    fn describe(&self) -> String { format!("file:{}", self.path.display()) }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = sibling(path, &format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let write = || -> std::io::Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        RegistryError::Storage(format!("writing {}: {e}", path.display()))
    })
}

/// Cross-process exclusive lock held for the lifetime of the guard. The file holds
/// a random token; a guard only ever removes a lock that still carries its token.
struct LockFile {
    path: PathBuf,
    token: String,
}

impl LockFile {
    fn acquire(path: &Path, opts: &FileLedgerOptions) -> Result<Self> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    if let Err(e) = f.write_all(token.as_bytes()).and_then(|_| f.sync_all()) {
                        let _ = fs::remove_file(path);
                        return Err(e.into());
                    }
                    return Ok(Self { path: path.to_path_buf(), token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(seen) = stale_token(path, opts.stale_lock_after) {
                        if break_stale(path, &seen) {
                            continue;
                        }
                    }
                    if start.elapsed() >= opts.lock_timeout {
                        return Err(RegistryError::Storage(format!("timed out waiting for ledger lock {}", path.display())));
                    }
                    std::thread::sleep(opts.poll_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(current) if current.trim() == self.token => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(lock = %self.path.display(), error = %e, "failed to release ledger lock");
                }
            }
            Ok(_) => warn!(lock = %self.path.display(), "ledger lock was broken while held; leaving the new holder's lock"),
            Err(e) => warn!(lock = %self.path.display(), error = %e, "failed to release ledger lock"),
        }
    }
}

/// Token of the lock at `path` when that same lock is older than `after`.
fn stale_token(path: &Path, after: Duration) -> Option<String> {
    let before = fs::read_to_string(path).ok()?;
    let age = fs::metadata(path).and_then(|m| m.modified()).ok().and_then(|t| SystemTime::now().duration_since(t).ok())?;
    let again = fs::read_to_string(path).ok()?;
    (age > after && before == again).then(|| before.trim().to_string())
}

/// Move the lock aside and delete it only if it is still the one judged stale.
/// A lock taken by another writer in the meantime is linked back in place.
/// Returns whether the lock path is worth retrying right away.
fn break_stale(path: &Path, seen: &str) -> bool {
    let aside = sibling(path, &format!(".stale-{}", uuid::Uuid::new_v4().simple()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return true,
        Err(e) => {
            warn!(lock = %path.display(), error = %e, "could not move stale ledger lock aside");
            return false;
        }
    }
    let moved = fs::read_to_string(&aside).map(|s| s.trim().to_string()).unwrap_or_default();
    if moved == seen {
        warn!(lock = %path.display(), "broke stale ledger lock");
        let _ = fs::remove_file(&aside);
        return true;
    }
    if let Err(e) = fs::hard_link(&aside, path) {
        warn!(lock = %path.display(), error = %e, "could not restore a live ledger lock");
    }
    let _ = fs::remove_file(&aside);
    false
}
