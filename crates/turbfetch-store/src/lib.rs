#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod layout;
pub mod lock;
pub mod registry;
pub mod session;
pub mod snapshot;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use turbfetch_core::state::SessionState;
use turbfetch_observe::time::unix_time_ms;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid path component {0:?}")]
    InvalidComponent(String),
    #[error("state document not found: {0}")]
    StateNotFound(PathBuf),
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session prefix {0:?} matches more than one session")]
    AmbiguousSession(String),
    #[error("variable {variable:?} is not part of dataset {dataset:?}")]
    UnknownVariable { variable: String, dataset: String },
    #[error("run lock is held: {0}")]
    Locked(PathBuf),
    #[error("snapshot store {path}: {reason}")]
    Snapshot { path: PathBuf, reason: String },
}

/// Persistence for one (session, variable) state document.
///
/// - `save_state` overwrites the whole record; it is called after every loop iteration.
/// - `load_state` restores every field except the failure streak, which restarts at zero.
pub trait StateStore: Send + Sync + 'static {
    fn load_state(&self) -> Result<SessionState, StoreError>;
    fn save_state(&self, state: &SessionState) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FsStateStore {
    path: PathBuf,
}

impl FsStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FsStateStore {
    fn load_state(&self) -> Result<SessionState, StoreError> {
        match read_json::<SessionState>(&self.path)? {
            Some(state) => Ok(state.resumed()),
            None => Err(StoreError::StateNotFound(self.path.clone())),
        }
    }

    fn save_state(&self, state: &SessionState) -> Result<(), StoreError> {
        write_json_atomic(&self.path, state)
    }
}

pub(crate) fn validate_component(value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty()
        || value.contains('/')
        || value.contains('\\')
        || value.contains("..")
    {
        return Err(StoreError::InvalidComponent(value.to_string()));
    }
    Ok(())
}

/// Reads and decodes a JSON document; `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Io(err)),
    }
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Write-temp-then-rename so a reader never observes a half-written document.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    let tmp = path.with_file_name(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        unix_time_ms()
    ));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_root;
    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() -> anyhow::Result<()> {
        let root = temp_root("atomic")?;
        let path = root.join("nested").join("doc.json");
        write_atomic(&path, b"first")?;
        write_atomic(&path, b"second")?;
        assert_eq!(std::fs::read(&path)?, b"second");

        let leftovers = std::fs::read_dir(root.join("nested"))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn state_store_round_trip_resets_streak() -> anyhow::Result<()> {
        let root = temp_root("state-roundtrip")?;
        let store = FsStateStore::new(root.join("state.json"));

        let mut state = SessionState::new(500);
        state.resume_volume_index = 77;
        state.resume_temporal_index = 2;
        state.current_query_limit = 412.25;
        state.record_outcome(false, 10);
        state.record_outcome(true, 10);
        state.num_consecutive_fails = 4;
        state.flags.is_first_chunk = false;
        store.save_state(&state)?;

        let loaded = store.load_state()?;
        assert_eq!(loaded.num_consecutive_fails, 0);
        state.num_consecutive_fails = 0;
        assert_eq!(loaded, state);
        Ok(())
    }

    #[test]
    fn missing_state_is_reported() -> anyhow::Result<()> {
        let root = temp_root("state-missing")?;
        let store = FsStateStore::new(root.join("absent.json"));
        match store.load_state() {
            Err(StoreError::StateNotFound(p)) => assert!(p.ends_with("absent.json")),
            other => panic!("expected StateNotFound, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn components_reject_traversal() {
        assert!(validate_component("velocity").is_ok());
        assert!(validate_component("../etc").is_err());
        assert!(validate_component("a/b").is_err());
        assert!(validate_component("  ").is_err());
    }
}
