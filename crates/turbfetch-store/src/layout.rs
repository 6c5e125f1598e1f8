use std::path::{Path, PathBuf};

use turbfetch_core::types::{GridConfig, QueryMethodConfig, SessionId};

use crate::{validate_component, StoreError};

pub const RUNTIME_CONFIG_FILE: &str = "runtime_config.json";
pub const REGISTRY_FILE: &str = "sessions.json";
pub const SESSION_CONFIG_FILE: &str = "session.json";
pub const STATE_FILE: &str = "state.json";
pub const RUN_LOCK_FILE: &str = "run.lock";
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Top-level documents shared by every session under one data root.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn runtime_config_path(&self) -> PathBuf {
        self.root.join(RUNTIME_CONFIG_FILE)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }
}

/// Human-readable directory name for a series; unique through the id suffix.
pub fn series_name(id: &SessionId, method: &QueryMethodConfig, grid: &GridConfig) -> String {
    format!(
        "{}__xs={}_xe={}_nx={}__ys={}_ye={}_ny={}__zs={}_ze={}_nz={}__ts={}_te={}_nt={}__hash={}",
        method.dataset_title,
        grid.x_bounds[0],
        grid.x_bounds[1],
        grid.nx,
        grid.y_bounds[0],
        grid.y_bounds[1],
        grid.ny,
        grid.z_bounds[0],
        grid.z_bounds[1],
        grid.nz,
        grid.t_bounds[0],
        grid.t_bounds[1],
        grid.nt,
        id.short()
    )
}

/// Paths of one session: `root/<dataset>/<series-name>/...`.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    series_dir: PathBuf,
}

impl SessionLayout {
    pub fn new(root: &DataRoot, dataset_title: &str, series_name: &str) -> Result<Self, StoreError> {
        validate_component(dataset_title)?;
        validate_component(series_name)?;
        Ok(Self {
            series_dir: root.path().join(dataset_title).join(series_name),
        })
    }

    pub fn series_dir(&self) -> &Path {
        &self.series_dir
    }

    pub fn session_config_path(&self) -> PathBuf {
        self.series_dir.join(SESSION_CONFIG_FILE)
    }

    pub fn variable_dir(&self, variable: &str) -> Result<PathBuf, StoreError> {
        validate_component(variable)?;
        Ok(self.series_dir.join(variable))
    }

    pub fn state_path(&self, variable: &str) -> Result<PathBuf, StoreError> {
        Ok(self.variable_dir(variable)?.join(STATE_FILE))
    }

    pub fn snapshots_dir(&self, variable: &str) -> Result<PathBuf, StoreError> {
        Ok(self.variable_dir(variable)?.join(SNAPSHOTS_DIR))
    }

    pub fn run_lock_path(&self, variable: &str) -> Result<PathBuf, StoreError> {
        Ok(self.variable_dir(variable)?.join(RUN_LOCK_FILE))
    }
}
