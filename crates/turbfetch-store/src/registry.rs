use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::lock::{acquire_run_lock, RunLockGuard};
use crate::{write_json_atomic, StoreError};

// A writer that crashed mid-update leaves its lock behind for at most this long.
const UPDATE_LOCK_STALE: Duration = Duration::from_secs(30);
const UPDATE_LOCK_WAIT: Duration = Duration::from_secs(10);
const UPDATE_LOCK_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub dataset_title: String,
    pub series_name: String,
    #[serde(default)]
    pub custom_tag: Option<String>,
    pub created_unix_ms: u64,
    #[serde(default)]
    pub completed: BTreeMap<String, bool>,
    #[serde(default)]
    pub last_loaded_unix_ms: BTreeMap<String, Option<u64>>,
    /// `[nx, ny, nz, nt]` of the session grid.
    #[serde(default)]
    pub grid_points: [u32; 4],
}

impl RegistryEntry {
    pub fn is_completed(&self, variable: &str) -> bool {
        self.completed.get(variable).copied().unwrap_or(false)
    }
}

/// `sessions.json`: session id -> entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl SessionRegistry {
    /// A missing or empty document reads as an empty registry.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Self::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json_atomic(path, self)
    }

    /// Read-modify-write of the registry document, serialized across processes by
    /// `<path>.lock`.
    pub fn update<T>(
        path: &Path,
        f: impl FnOnce(&mut SessionRegistry) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = lock_for_update(path)?;
        let mut registry = Self::load(path)?;
        let out = f(&mut registry)?;
        registry.save(path)?;
        Ok(out)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: String, entry: RegistryEntry) -> Result<(), StoreError> {
        if self.entries.contains_key(&id) {
            return Err(StoreError::SessionExists(id));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.entries.iter()
    }

    pub fn filter<'a>(
        &'a self,
        filter: &'a RegistryFilter,
    ) -> impl Iterator<Item = (&'a String, &'a RegistryEntry)> + 'a {
        self.entries
            .iter()
            .filter(move |(id, entry)| filter.matches(id, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a full id or a unique id prefix.
    pub fn resolve(&self, id_or_prefix: &str) -> Result<(&str, &RegistryEntry), StoreError> {
        if let Some((id, entry)) = self.entries.get_key_value(id_or_prefix) {
            return Ok((id.as_str(), entry));
        }
        if id_or_prefix.is_empty() {
            return Err(StoreError::SessionNotFound(id_or_prefix.to_string()));
        }
        let mut matches = self
            .entries
            .range(id_or_prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(id_or_prefix));
        match (matches.next(), matches.next()) {
            (Some((id, entry)), None) => Ok((id.as_str(), entry)),
            (Some(_), Some(_)) => Err(StoreError::AmbiguousSession(id_or_prefix.to_string())),
            (None, _) => Err(StoreError::SessionNotFound(id_or_prefix.to_string())),
        }
    }

    pub fn mark_completed(&mut self, id: &str, variable: &str) -> Result<(), StoreError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        entry.completed.insert(variable.to_string(), true);
        Ok(())
    }

    pub fn mark_loaded(&mut self, id: &str, variable: &str, unix_ms: u64) -> Result<(), StoreError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        entry
            .last_loaded_unix_ms
            .insert(variable.to_string(), Some(unix_ms));
        Ok(())
    }
}

/// Search over registry entries. Text fields match by substring, grid sizes exactly;
/// unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryFilter {
    pub hash: Option<String>,
    pub custom_tag: Option<String>,
    pub dataset: Option<String>,
    pub variable: Option<String>,
    pub nx: Option<u32>,
    pub ny: Option<u32>,
    pub nz: Option<u32>,
    pub nt: Option<u32>,
}

impl RegistryFilter {
    pub fn matches(&self, id: &str, entry: &RegistryEntry) -> bool {
        fn contains(haystack: &str, needle: &Option<String>) -> bool {
            needle.as_deref().map_or(true, |n| haystack.contains(n))
        }

        let tag_ok = match (&self.custom_tag, &entry.custom_tag) {
            (None, _) => true,
            (Some(needle), Some(tag)) => tag.contains(needle.as_str()),
            (Some(_), None) => false,
        };
        let variable_ok = self
            .variable
            .as_deref()
            .map_or(true, |n| entry.completed.keys().any(|v| v.contains(n)));
        let sizes = [self.nx, self.ny, self.nz, self.nt];
        let sizes_ok = sizes
            .iter()
            .zip(entry.grid_points)
            .all(|(want, have)| want.map_or(true, |w| w == have));

        contains(id, &self.hash)
            && contains(&entry.dataset_title, &self.dataset)
            && tag_ok
            && variable_ok
            && sizes_ok
    }
}

fn lock_for_update(path: &Path) -> Result<RunLockGuard, StoreError> {
    let mut lock_path = OsString::from(path.as_os_str());
    lock_path.push(".lock");
    let lock_path = PathBuf::from(lock_path);

    let deadline = Instant::now() + UPDATE_LOCK_WAIT;
    loop {
        match acquire_run_lock(&lock_path, UPDATE_LOCK_STALE) {
            Err(StoreError::Locked(_)) if Instant::now() < deadline => {
                std::thread::sleep(UPDATE_LOCK_POLL);
            }
            other => return other,
        }
    }
}
