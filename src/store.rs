//! Package store
//!
//! Maps a published [`RequirementRef`] to its install folder and exported
//! environment. An identity is immutable once published: putting identical
//! content again is a no-op, putting different content is a
//! [`StoreError::Conflict`].
//!
//! On-disk layout ([`DiskStore`]):
//!
//! ```text
//! <root>/<name>/<version>/<user>/<channel>/
//!     package/            install folder
//!     .staging-XXXXXX/    one per package stage, renamed to package/ on commit
//!     packageinfo.toml    written last; its presence means "published"
//!     .lock
//! ```

use crate::lock::{EntryLock, KeyedLocks};
use crate::reference::RequirementRef;
use crate::recipe::ExportedEnv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

const PACKAGE_DIR: &str = "package";
const STAGING_PREFIX: &str = ".staging-";
const METADATA_FILE: &str = "packageinfo.toml";

/// What a published package makes available to its dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub reference: RequirementRef,
    pub install_path: PathBuf,
    /// Digest of the build context the package was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_digest: Option<String>,
    #[serde(default)]
    pub exported_env: ExportedEnv,
}

impl PackageInfo {
    pub fn new(
        reference: RequirementRef,
        install_path: PathBuf,
        exported_env: ExportedEnv,
    ) -> Self {
        Self {
            reference,
            install_path,
            exported_env,
            context_digest: None,
        }
    }

    pub fn with_context_digest(mut self, digest: String) -> Self {
        self.context_digest = Some(digest);
        self
    }

    /// Content that identifies a publication. The digest is informational.
    pub fn same_content(&self, other: &PackageInfo) -> bool {
        self.install_path == other.install_path && self.exported_env == other.exported_env
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Published,
    /// Identical content was already published
    Unchanged,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("package not found: {0}")]
    NotFound(RequirementRef),

    #[error(
        "conflicting content for {reference}: already published at {} with a different install path or exported environment",
        existing.install_path.display()
    )]
    Conflict {
        reference: RequirementRef,
        existing: Box<PackageInfo>,
        attempted: Box<PackageInfo>,
    },

    #[error("package info for {found} cannot be stored under {expected}")]
    ReferenceMismatch {
        expected: RequirementRef,
        found: RequirementRef,
    },

    #[error("store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid package metadata at {}: {message}", path.display())]
    Metadata { path: PathBuf, message: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub trait PackageStore: Send + Sync {
    /// Published info for `reference`, or [`StoreError::NotFound`].
    fn get(&self, reference: &RequirementRef) -> Result<PackageInfo, StoreError>;

    /// Record `info` under `reference`. Atomic per reference.
    fn put(&self, reference: &RequirementRef, info: PackageInfo) -> Result<PutOutcome, StoreError>;

    /// Where the package of `reference` lives once published.
    fn install_path(&self, reference: &RequirementRef) -> PathBuf;

    /// A fresh staging folder for one package stage of `reference`.
    ///
    /// Every call gets its own folder, so two writers of one reference never
    /// share staged files. The folder is removed on drop unless published.
    fn stage(&self, reference: &RequirementRef) -> Result<TempDir, StoreError>;

    /// Commit `staged` as the install folder of `info.reference` and record
    /// `info`. If `reference` is already published the staged files are
    /// discarded and `info` is only compared.
    fn publish(&self, info: PackageInfo, staged: &Path) -> Result<PutOutcome, StoreError>;

    /// `get` with "not found" mapped to `None`.
    fn find(&self, reference: &RequirementRef) -> Result<Option<PackageInfo>, StoreError> {
        match self.get(reference) {
            Ok(info) => Ok(Some(info)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn check_reference(reference: &RequirementRef, info: &PackageInfo) -> Result<(), StoreError> {
    if &info.reference != reference {
        return Err(StoreError::ReferenceMismatch {
            expected: reference.clone(),
            found: info.reference.clone(),
        });
    }
    Ok(())
}

fn compare(existing: PackageInfo, attempted: PackageInfo) -> Result<PutOutcome, StoreError> {
    if existing.same_content(&attempted) {
        Ok(PutOutcome::Unchanged)
    } else {
        Err(StoreError::Conflict {
            reference: attempted.reference.clone(),
            existing: Box::new(existing),
            attempted: Box::new(attempted),
        })
    }
}

fn entry_dir(root: &Path, reference: &RequirementRef) -> PathBuf {
    reference
        .path_segments()
        .iter()
        .fold(root.to_path_buf(), |dir, segment| dir.join(segment))
}

/// Replace `dest` with the contents of `staged`.
fn commit_staged(staged: &Path, dest: &Path) -> Result<(), StoreError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| StoreError::io(dest, e))?;
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    if staged.exists() {
        std::fs::rename(staged, dest).map_err(|e| StoreError::io(staged, e))?;
    } else {
        std::fs::create_dir_all(dest).map_err(|e| StoreError::io(dest, e))?;
    }
    Ok(())
}

fn stage_in(entry: &Path) -> Result<TempDir, StoreError> {
    std::fs::create_dir_all(entry).map_err(|e| StoreError::io(entry, e))?;
    tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(entry)
        .map_err(|e| StoreError::io(entry, e))
}

fn discard_staged(staged: &Path) {
    let _ = std::fs::remove_dir_all(staged);
}

/// Process-local store. Install folders still live on disk under `root`.
#[derive(Debug)]
pub struct MemoryStore {
    root: PathBuf,
    entries: RwLock<HashMap<RequirementRef, PackageInfo>>,
    locks: KeyedLocks<RequirementRef>,
}

impl MemoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    fn put_locked(&self, info: PackageInfo) -> Result<PutOutcome, StoreError> {
        let existing = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&info.reference)
            .cloned();
        match existing {
            Some(existing) => compare(existing, info),
            None => {
                self.entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(info.reference.clone(), info);
                Ok(PutOutcome::Published)
            }
        }
    }
}

impl PackageStore for MemoryStore {
    fn get(&self, reference: &RequirementRef) -> Result<PackageInfo, StoreError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.clone()))
    }

    fn put(&self, reference: &RequirementRef, info: PackageInfo) -> Result<PutOutcome, StoreError> {
        check_reference(reference, &info)?;
        self.locks.with_lock(reference, || self.put_locked(info))
    }

    fn install_path(&self, reference: &RequirementRef) -> PathBuf {
        entry_dir(&self.root, reference).join(PACKAGE_DIR)
    }

    fn stage(&self, reference: &RequirementRef) -> Result<TempDir, StoreError> {
        stage_in(&entry_dir(&self.root, reference))
    }

    fn publish(&self, info: PackageInfo, staged: &Path) -> Result<PutOutcome, StoreError> {
        let reference = info.reference.clone();
        self.locks.with_lock(&reference, || {
            if let Ok(existing) = self.get(&reference) {
                discard_staged(staged);
                return compare(existing, info);
            }
            commit_staged(staged, &self.install_path(&reference))?;
            self.put_locked(info)
        })
    }
}

/// Store persisted under a root directory.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    locks: KeyedLocks<RequirementRef>,
}

impl DiskStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self {
            root,
            locks: KeyedLocks::new(),
        })
    }

    fn metadata_path(&self, reference: &RequirementRef) -> PathBuf {
        entry_dir(&self.root, reference).join(METADATA_FILE)
    }

    fn read_metadata(&self, reference: &RequirementRef) -> Result<Option<PackageInfo>, StoreError> {
        let path = self.metadata_path(reference);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let info: PackageInfo = toml::from_str(&content).map_err(|e| StoreError::Metadata {
            path: path.clone(),
            message: e.to_string(),
        })?;
        if &info.reference != reference {
            return Err(StoreError::Metadata {
                path,
                message: format!("records {} instead", info.reference),
            });
        }
        Ok(Some(info))
    }

    /// Temp file + rename: readers see the old state or the full new one.
    fn write_metadata(&self, info: &PackageInfo) -> Result<(), StoreError> {
        let path = self.metadata_path(&info.reference);
        let dir = entry_dir(&self.root, &info.reference);
        let content = toml::to_string_pretty(info).map_err(|e| StoreError::Metadata {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let header = "# packageinfo.toml - written by kitchen, do not edit\n\n";

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let written: std::io::Result<()> = (|| {
            tmp.write_all(header.as_bytes())?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()
        })();
        written.map_err(|e| StoreError::io(&dir, e))?;
        tmp.persist(&path).map_err(|e| StoreError::io(&path, e.error))?;
        Ok(())
    }

    /// Run `f` holding both the in-process and the cross-process entry lock.
    fn with_entry_lock<R>(
        &self,
        reference: &RequirementRef,
        f: impl FnOnce() -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.locks.with_lock(reference, || {
            let dir = entry_dir(&self.root, reference);
            let _lock = EntryLock::acquire(&dir).map_err(|e| StoreError::io(&dir, e))?;
            f()
        })
    }

    fn put_locked(&self, info: PackageInfo) -> Result<PutOutcome, StoreError> {
        match self.read_metadata(&info.reference)? {
            Some(existing) => compare(existing, info),
            None => {
                self.write_metadata(&info)?;
                info!(reference = %info.reference, "published package");
                Ok(PutOutcome::Published)
            }
        }
    }
}

impl PackageStore for DiskStore {
    fn get(&self, reference: &RequirementRef) -> Result<PackageInfo, StoreError> {
        self.read_metadata(reference)?
            .ok_or_else(|| StoreError::NotFound(reference.clone()))
    }

    fn put(&self, reference: &RequirementRef, info: PackageInfo) -> Result<PutOutcome, StoreError> {
        check_reference(reference, &info)?;
        self.with_entry_lock(reference, || self.put_locked(info))
    }

    fn install_path(&self, reference: &RequirementRef) -> PathBuf {
        entry_dir(&self.root, reference).join(PACKAGE_DIR)
    }

    fn stage(&self, reference: &RequirementRef) -> Result<TempDir, StoreError> {
        stage_in(&entry_dir(&self.root, reference))
    }

    fn publish(&self, info: PackageInfo, staged: &Path) -> Result<PutOutcome, StoreError> {
        let reference = info.reference.clone();
        self.with_entry_lock(&reference, || {
            if let Some(existing) = self.read_metadata(&reference)? {
                debug!(reference = %reference, "already published, comparing content");
                discard_staged(staged);
                return compare(existing, info);
            }
            // No metadata: any install folder is a leftover of an interrupted run.
            commit_staged(staged, &self.install_path(&reference))?;
            self.put_locked(info)
        })
    }
}
