//! Store entry locking
//!
//! Serializes writers of one store entry, across threads and processes.
//! The lock file is left in place: removing it while another writer waits on
//! the old inode would let two writers in at once.

use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const LOCK_FILE: &str = ".lock";

/// Exclusive `flock` on a lock file, released on drop.
#[derive(Debug)]
pub struct EntryLock {
    file: File,
}

impl EntryLock {
    /// Block until `<dir>/.lock` is held.
    pub fn acquire(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Self::acquire_file(&dir.join(LOCK_FILE))
    }

    /// Block until `path` is held. For directories that are wiped while
    /// locked, the lock file has to live next to them.
    pub fn acquire_file(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

/// `<dir>.lock`, the sibling lock file of `dir`.
pub fn sibling_lock_path(dir: &Path) -> PathBuf {
    let mut path = dir.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// One mutex per key, created on first use. No cross-key locking.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the mutex for `key`.
    pub fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let entry = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard: MutexGuard<'_, ()> = entry.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
