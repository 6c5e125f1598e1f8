use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use turbfetch_core::state::SessionState;
use turbfetch_core::types::{DatasetConstraints, GridConfig, QueryMethodConfig, SessionId};
use turbfetch_observe::time::unix_time_ms;

use crate::layout::{series_name, DataRoot, SessionLayout};
use crate::lock::{acquire_run_lock, RunLockGuard};
use crate::registry::{RegistryEntry, SessionRegistry};
use crate::snapshot::FsSnapshotStore;
use crate::{read_json, write_json_atomic, FsStateStore, StateStore, StoreError};

/// `session.json`: the immutable configuration a session was created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfigs {
    pub session_id: SessionId,
    pub dataset_constraints: DatasetConstraints,
    pub query_method_config: QueryMethodConfig,
    pub grid_config: GridConfig,
    #[serde(default)]
    pub custom_tag: Option<String>,
    pub created_unix_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OpenSession {
    pub root: DataRoot,
    pub layout: SessionLayout,
    pub configs: SessionConfigs,
}

impl OpenSession {
    pub fn id(&self) -> &SessionId {
        &self.configs.session_id
    }

    pub fn variables(&self) -> &[String] {
        &self.configs.dataset_constraints.dataset_variables
    }

    fn check_variable(&self, variable: &str) -> Result<(), StoreError> {
        if self.variables().iter().any(|v| v == variable) {
            Ok(())
        } else {
            Err(StoreError::UnknownVariable {
                variable: variable.to_string(),
                dataset: self.configs.query_method_config.dataset_title.clone(),
            })
        }
    }

    pub fn state_store(&self, variable: &str) -> Result<FsStateStore, StoreError> {
        self.check_variable(variable)?;
        Ok(FsStateStore::new(self.layout.state_path(variable)?))
    }

    pub fn snapshot_store(&self, variable: &str) -> Result<FsSnapshotStore, StoreError> {
        self.check_variable(variable)?;
        Ok(FsSnapshotStore::new(
            self.layout.snapshots_dir(variable)?,
            self.id().clone(),
        ))
    }

    pub fn lock_variable(
        &self,
        variable: &str,
        stale_after: Duration,
    ) -> Result<RunLockGuard, StoreError> {
        self.check_variable(variable)?;
        acquire_run_lock(&self.layout.run_lock_path(variable)?, stale_after)
    }

    pub fn mark_loaded(&self, variable: &str) -> Result<(), StoreError> {
        let id = self.id().as_str();
        SessionRegistry::update(&self.root.registry_path(), |reg| {
            reg.mark_loaded(id, variable, unix_time_ms())
        })
    }

    pub fn mark_completed(&self, variable: &str) -> Result<(), StoreError> {
        let id = self.id().as_str();
        SessionRegistry::update(&self.root.registry_path(), |reg| {
            reg.mark_completed(id, variable)
        })
    }
}

/// Request for a new session. The grid must already be validated.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub dataset_constraints: DatasetConstraints,
    pub query_method_config: QueryMethodConfig,
    pub grid_config: GridConfig,
    pub custom_tag: Option<String>,
    pub starting_query_limit: u64,
}

/// Writes `session.json`, a fresh state document per dataset variable, and the
/// registry entry. Fails with `SessionExists` if the id is already registered.
pub fn create_session(root: &DataRoot, req: NewSession) -> Result<OpenSession, StoreError> {
    let id = SessionId::derive(&req.grid_config, &req.query_method_config)?;
    let registry_path = root.registry_path();
    if SessionRegistry::load(&registry_path)?.contains(id.as_str()) {
        return Err(StoreError::SessionExists(id.to_string()));
    }

    let name = series_name(&id, &req.query_method_config, &req.grid_config);
    let layout = SessionLayout::new(root, &req.query_method_config.dataset_title, &name)?;
    let created_unix_ms = unix_time_ms();
    let configs = SessionConfigs {
        session_id: id.clone(),
        dataset_constraints: req.dataset_constraints,
        query_method_config: req.query_method_config,
        grid_config: req.grid_config,
        custom_tag: req.custom_tag,
        created_unix_ms,
    };
    let session = OpenSession {
        root: root.clone(),
        layout,
        configs,
    };

    write_json_atomic(&session.layout.session_config_path(), &session.configs)?;
    let fresh = SessionState::new(req.starting_query_limit);
    for variable in session.variables() {
        session.state_store(variable)?.save_state(&fresh)?;
    }

    let entry = RegistryEntry {
        dataset_title: session.configs.query_method_config.dataset_title.clone(),
        series_name: name,
        custom_tag: session.configs.custom_tag.clone(),
        created_unix_ms,
        completed: session
            .variables()
            .iter()
            .map(|v| (v.clone(), false))
            .collect::<BTreeMap<_, _>>(),
        last_loaded_unix_ms: session
            .variables()
            .iter()
            .map(|v| (v.clone(), None))
            .collect::<BTreeMap<_, _>>(),
        grid_points: {
            let g = &session.configs.grid_config;
            [g.nx, g.ny, g.nz, g.nt]
        },
    };
    SessionRegistry::update(&registry_path, |reg| reg.insert(id.to_string(), entry))?;

    tracing::info!(
        target: "turbfetch_store",
        event = "session_created",
        session_id = %id,
        series_dir = %session.layout.series_dir().display(),
        variables = session.variables().len(),
        "session created"
    );
    Ok(session)
}

/// Opens a registered session by full id or unique prefix.
pub fn open_session(root: &DataRoot, id_or_prefix: &str) -> Result<OpenSession, StoreError> {
    let registry = SessionRegistry::load(&root.registry_path())?;
    let (id, entry) = registry.resolve(id_or_prefix)?;
    let layout = SessionLayout::new(root, &entry.dataset_title, &entry.series_name)?;
    let config_path: PathBuf = layout.session_config_path();
    let configs = read_json::<SessionConfigs>(&config_path)?
        .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
    Ok(OpenSession {
        root: root.clone(),
        layout,
        configs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;

    fn request() -> NewSession {
        NewSession {
            dataset_constraints: DatasetConstraints {
                min_dt: 0.002,
                domain_x: [0.0, 6.28],
                domain_y: [0.0, 6.28],
                domain_z: [0.0, 6.28],
                domain_t: [0.0, 2.048],
                max_res_x: 1024,
                max_res_y: 1024,
                max_res_z: 1024,
                max_time_indices: 4000,
                dataset_variables: vec!["velocity".to_string(), "pressure".to_string()],
                variable_components: BTreeMap::from([
                    ("velocity".to_string(), 3),
                    ("pressure".to_string(), 1),
                ]),
                axis_coordinates: BTreeMap::new(),
            },
            query_method_config: QueryMethodConfig {
                dataset_title: "isotropic1024coarse".to_string(),
                temporal_method: "none".to_string(),
                spatial_method: "lag4".to_string(),
                spatial_operator: "field".to_string(),
            },
            grid_config: GridConfig {
                nx: 4,
                ny: 4,
                nz: 1,
                nt: 2,
                x_bounds: [0.0, 1.0],
                y_bounds: [0.0, 1.0],
                z_bounds: [0.5, 1.5],
                t_bounds: [0.0, 0.1],
            },
            custom_tag: Some("smoke".to_string()),
            starting_query_limit: 250,
        }
    }

    #[test]
    fn create_writes_state_per_variable_and_registers() -> anyhow::Result<()> {
        let root = DataRoot::new(temp_root("session-create")?);
        let created = create_session(&root, request())?;

        for variable in ["velocity", "pressure"] {
            let state = created.state_store(variable)?.load_state()?;
            assert_eq!(state, SessionState::new(250));
        }
        assert!(matches!(
            created.state_store("temperature"),
            Err(StoreError::UnknownVariable { .. })
        ));

        let opened = open_session(&root, created.id().short())?;
        assert_eq!(opened.configs, created.configs);
        assert_eq!(opened.configs.custom_tag.as_deref(), Some("smoke"));
        Ok(())
    }

    #[test]
    fn duplicate_session_is_rejected() -> anyhow::Result<()> {
        let root = DataRoot::new(temp_root("session-dup")?);
        create_session(&root, request())?;
        assert!(matches!(
            create_session(&root, request()),
            Err(StoreError::SessionExists(_))
        ));
        Ok(())
    }

    #[test]
    fn completion_is_recorded_in_registry() -> anyhow::Result<()> {
        let root = DataRoot::new(temp_root("session-complete")?);
        let session = create_session(&root, request())?;
        session.mark_loaded("pressure")?;
        session.mark_completed("pressure")?;

        let reg = SessionRegistry::load(&root.registry_path())?;
        let entry = reg.get(session.id().as_str()).expect("entry");
        assert!(entry.is_completed("pressure"));
        assert!(!entry.is_completed("velocity"));
        assert_eq!(entry.grid_points, [4, 4, 1, 2]);
        assert!(entry
            .last_loaded_unix_ms
            .get("pressure")
            .copied()
            .flatten()
            .is_some());
        Ok(())
    }
}
