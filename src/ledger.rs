//! Append-only ledger of certified identifiers.
//!
//! Layout under the ledger directory:
//!
//! ```text
//! versions/kernel_00000001_20261016T120000123456.json   ["a1b2...", ...]
//! versions/kernel_00000002_20261016T120005000001.json
//! latest.link                                           kernel_00000002_...json
//! state.json                                            {"lineage": [...], "ejected": [...]}
//! ```
//!
//! Every version is an immutable JSON array of identifiers. The pointer
//! file names the current version. The state file records the lineage
//! (the versions leading to the current one, so rollback never lands on an
//! abandoned branch) and the identifiers ejected since their last
//! certification. All three are written to a temporary file, fsynced, and
//! renamed into place, so a reader always sees a complete snapshot through
//! the pointer. No cross-process lock is taken: two concurrent writers each
//! produce a snapshot and the last rename wins.
//!
//! An ejected identifier never comes back through rollback: a target
//! version that still lists one is rewritten without it as a new version.
//! Only [`Ledger::amend`] lets it re-enter.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::identity::SovereignId;

/// Default pointer file name.
pub const DEFAULT_POINTER: &str = "latest.link";

/// Subdirectory holding version snapshots.
pub const VERSIONS_DIR: &str = "versions";

/// File holding the lineage and ejection record.
pub const STATE_FILE: &str = "state.json";

const SNAPSHOT_PREFIX: &str = "kernel_";
const SNAPSHOT_SUFFIX: &str = ".json";

/// Ledger I/O and consistency errors. Never swallowed by callers.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Filesystem operation failed.
    #[error("ledger I/O failed at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A snapshot or the state file does not parse.
    #[error("ledger file {path} is corrupt: {source}")]
    Corrupt {
        /// File path.
        path: PathBuf,
        /// Parse error.
        source: serde_json::Error,
    },
    /// The pointer names a snapshot that does not exist.
    #[error("ledger pointer references missing snapshot {0}")]
    MissingSnapshot(PathBuf),
    /// The pointer content is not a snapshot file name.
    #[error("ledger pointer {path} holds invalid content '{content}'")]
    InvalidPointer {
        /// Pointer path.
        path: PathBuf,
        /// Raw pointer content.
        content: String,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Lineage and ejection record persisted beside the pointer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LedgerState {
    /// Versions from the first to the current one; rollback pops it.
    #[serde(default)]
    lineage: Vec<String>,
    /// Identifiers ejected and not certified again since.
    #[serde(default)]
    ejected: Vec<SovereignId>,
}

/// On-disk, pointer-selected set of certified identifiers.
#[derive(Debug)]
pub struct Ledger {
    dir: PathBuf,
    pointer: PathBuf,
    identifiers: Vec<SovereignId>,
    current: Option<String>,
    state: LedgerState,
}

impl Ledger {
    /// Open (or create) a ledger rooted at `dir`.
    ///
    /// With no pointer file the ledger starts empty with no current
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the directories cannot be created, or the
    /// pointer names a missing or corrupt snapshot.
    pub fn open(dir: impl Into<PathBuf>, pointer_name: &str) -> Result<Self, LedgerError> {
        let dir = dir.into();
        let versions = dir.join(VERSIONS_DIR);
        fs::create_dir_all(&versions).map_err(io_err(&versions))?;

        let pointer = dir.join(pointer_name);
        let mut ledger = Self {
            dir,
            pointer,
            identifiers: Vec::new(),
            current: None,
            state: LedgerState::default(),
        };

        match fs::read_to_string(&ledger.pointer) {
            Ok(content) => {
                let name = content.trim();
                if !is_snapshot_name(name) {
                    return Err(LedgerError::InvalidPointer {
                        path: ledger.pointer.clone(),
                        content: content.clone(),
                    });
                }
                ledger.identifiers = ledger.load_snapshot(name)?;
                ledger.current = Some(name.to_owned());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&ledger.pointer)(e)),
        }
        ledger.state = ledger.load_state()?;
        ledger.reconcile_lineage();

        info!(
            dir = %ledger.dir.display(),
            version = ledger.current.as_deref().unwrap_or("none"),
            identifiers = ledger.identifiers.len(),
            ejected = ledger.state.ejected.len(),
            "ledger opened"
        );
        Ok(ledger)
    }

    /// Ledger root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identifiers in the current version, in insertion order.
    pub fn identifiers(&self) -> &[SovereignId] {
        &self.identifiers
    }

    /// Whether `id` is in the current version.
    pub fn contains(&self, id: &SovereignId) -> bool {
        self.identifiers.contains(id)
    }

    /// Identifiers ejected and not certified again since.
    pub fn ejected(&self) -> &[SovereignId] {
        &self.state.ejected
    }

    /// Whether `id` has been ejected and not certified again since.
    pub fn is_ejected(&self, id: &SovereignId) -> bool {
        self.state.ejected.contains(id)
    }

    /// Versions leading to the current one, oldest first.
    pub fn lineage(&self) -> &[String] {
        &self.state.lineage
    }

    /// File name of the current version, if any.
    pub fn current_version(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// All snapshot file names, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the versions directory cannot be read.
    pub fn versions(&self) -> Result<Vec<String>, LedgerError> {
        let versions = self.versions_dir();
        let entries = fs::read_dir(&versions).map_err(io_err(&versions))?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_snapshot_name(name))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Append `id` as a new version.
    ///
    /// Returns `false` without writing a version if `id` is already present.
    /// A previously ejected `id` re-enters here and loses its ejection mark.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the snapshot, state or pointer cannot be
    /// written; the previous version stays current in that case.
    pub fn amend(&mut self, id: &SovereignId) -> Result<bool, LedgerError> {
        let mut state = self.state.clone();
        let was_ejected = state.ejected.contains(id);
        state.ejected.retain(|ejected| ejected != id);

        if self.contains(id) {
            if was_ejected {
                self.write_state(&state)?;
                self.state = state;
            }
            debug!(id = %id, "identifier already in ledger");
            return Ok(false);
        }
        let mut next = self.identifiers.clone();
        next.push(id.clone());
        let name = self.commit(next, state)?;
        info!(id = %id, version = %name, recertified = was_ejected, "ledger amended");
        Ok(true)
    }

    /// Mark `id` as ejected so no later rollback restores it.
    ///
    /// Does not change the current version; pair it with [`Ledger::rollback`]
    /// or [`Ledger::retract`].
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the state file cannot be written.
    pub fn record_ejection(&mut self, id: &SovereignId) -> Result<(), LedgerError> {
        if self.is_ejected(id) {
            return Ok(());
        }
        let mut state = self.state.clone();
        state.ejected.push(id.clone());
        self.write_state(&state)?;
        self.state = state;
        info!(id = %id, "ejection recorded");
        Ok(())
    }

    /// Write a new version without `id`.
    ///
    /// Returns `false` without writing anything if `id` is absent.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the snapshot or pointer cannot be written.
    pub fn retract(&mut self, id: &SovereignId) -> Result<bool, LedgerError> {
        if !self.contains(id) {
            return Ok(false);
        }
        let next: Vec<SovereignId> = self
            .identifiers
            .iter()
            .filter(|existing| *existing != id)
            .cloned()
            .collect();
        let name = self.commit(next, self.state.clone())?;
        info!(id = %id, version = %name, "identifier retracted from ledger");
        Ok(true)
    }

    /// Repoint to the version before the current one in the lineage and
    /// reload it.
    ///
    /// If that version lists ejected identifiers, a new version without
    /// them is written on top of it instead of repointing. Returns `false`
    /// when the lineage holds fewer than two versions.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the snapshot cannot be read or the state
    /// or pointer cannot be written; the in-memory state is unchanged then.
    pub fn rollback(&mut self) -> Result<bool, LedgerError> {
        if self.state.lineage.len() < 2 {
            debug!(lineage = self.state.lineage.len(), "nothing to roll back to");
            return Ok(false);
        }
        let mut state = self.state.clone();
        state.lineage.pop();
        let Some(target) = state.lineage.last().cloned() else {
            return Ok(false);
        };

        let restored = self.load_snapshot(&target)?;
        let (kept, dropped): (Vec<SovereignId>, Vec<SovereignId>) = restored
            .into_iter()
            .partition(|id| !state.ejected.contains(id));

        if dropped.is_empty() {
            self.write_state(&state)?;
            self.write_pointer(&target)?;
            info!(
                from = self.current.as_deref().unwrap_or("none"),
                to = %target,
                "ledger rolled back"
            );
            self.identifiers = kept;
            self.current = Some(target);
            self.state = state;
        } else {
            warn!(
                to = %target,
                ejected = dropped.len(),
                "rollback target lists ejected identifiers, writing them out"
            );
            let name = self.commit(kept, state)?;
            info!(to = %target, version = %name, "ledger rolled back");
        }
        Ok(true)
    }

    fn versions_dir(&self) -> PathBuf {
        self.dir.join(VERSIONS_DIR)
    }

    /// Persist `identifiers` as a new snapshot on top of `state`'s lineage,
    /// write the state, swap the pointer, then adopt everything in memory.
    fn commit(
        &mut self,
        identifiers: Vec<SovereignId>,
        mut state: LedgerState,
    ) -> Result<String, LedgerError> {
        let name = self.next_snapshot_name()?;
        let path = self.versions_dir().join(&name);
        let bytes = serde_json::to_vec(&identifiers).map_err(|source| LedgerError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)?;
        state.lineage.push(name.clone());
        self.write_state(&state)?;
        self.write_pointer(&name)?;
        self.identifiers = identifiers;
        self.current = Some(name.clone());
        self.state = state;
        Ok(name)
    }

    fn write_pointer(&self, name: &str) -> Result<(), LedgerError> {
        write_atomic(&self.pointer, format!("{name}\n").as_bytes())
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn write_state(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let path = self.state_path();
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| LedgerError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)
    }

    /// Read the state file. A ledger written without one gets a lineage of
    /// every version up to the current one by name.
    fn load_state(&self) -> Result<LedgerState, LedgerError> {
        let path = self.state_path();
        match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| LedgerError::Corrupt { path, source })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let lineage = match self.current.as_deref() {
                    Some(current) => self
                        .versions()?
                        .into_iter()
                        .filter(|name| name.as_str() <= current)
                        .collect(),
                    None => Vec::new(),
                };
                Ok(LedgerState {
                    lineage,
                    ejected: Vec::new(),
                })
            }
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Make the lineage end at the pointer. The state is written before the
    /// pointer, so after a crash it may run one version ahead or behind.
    fn reconcile_lineage(&mut self) {
        let Some(current) = self.current.clone() else {
            self.state.lineage.clear();
            return;
        };
        match self.state.lineage.iter().position(|name| *name == current) {
            Some(index) => self.state.lineage.truncate(index.saturating_add(1)),
            None => self.state.lineage.push(current),
        }
    }

    fn load_snapshot(&self, name: &str) -> Result<Vec<SovereignId>, LedgerError> {
        let path = self.versions_dir().join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::MissingSnapshot(path));
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| LedgerError::Corrupt { path, source })
    }

    /// `kernel_<seq>_<timestamp>.json`, with `seq` one past the highest on disk.
    fn next_snapshot_name(&self) -> Result<String, LedgerError> {
        let seq = self
            .versions()?
            .iter()
            .filter_map(|name| snapshot_seq(name))
            .max()
            .map_or(1, |highest| highest.saturating_add(1));
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f");
        Ok(format!("{SNAPSHOT_PREFIX}{seq:08}_{stamp}{SNAPSHOT_SUFFIX}"))
    }
}

fn is_snapshot_name(name: &str) -> bool {
    snapshot_seq(name).is_some()
}

fn snapshot_seq(name: &str) -> Option<u64> {
    let stem = name
        .strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?;
    let (seq, stamp) = stem.split_once('_')?;
    if stamp.is_empty() || !stamp.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    seq.parse().ok()
}

/// Write `bytes` to `path` via a fsynced sibling temp file and a rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LedgerError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path).map_err(io_err(&tmp_path))?;
    file.write_all(bytes).map_err(io_err(&tmp_path))?;
    file.sync_all().map_err(io_err(&tmp_path))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(io_err(path))?;
    sync_parent(path);
    Ok(())
}

/// Flush the directory entry for a rename. Best effort.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(dir = %parent.display(), error = %e, "directory fsync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
