#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use turbfetch_core::config::Tunable;
use turbfetch_core::state::SessionState;
use turbfetch_core::types::{DatasetConstraints, GridConfig, QueryMethodConfig, SessionId};
use turbfetch_runtime::client::{QueryClient, QueryError, QueryRequest, QueryResponse};
use turbfetch_runtime::events::SessionEvent;
use turbfetch_runtime::orchestrator::SessionContext;
use turbfetch_runtime::sink::{ChunkSink, SinkError, SnapshotChunk};
use turbfetch_store::{StateStore, StoreError};

pub fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "turbfetch-runtime-{}-{}-{}",
        test_name,
        std::process::id(),
        turbfetch_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn constraints() -> DatasetConstraints {
    DatasetConstraints {
        min_dt: 0.1,
        domain_x: [0.0, 1.0],
        domain_y: [0.0, 1.0],
        domain_z: [0.0, 1.0],
        domain_t: [0.0, 10.0],
        max_res_x: 11,
        max_res_y: 11,
        max_res_z: 11,
        max_time_indices: 4000,
        dataset_variables: vec!["velocity".to_string()],
        variable_components: BTreeMap::from([("velocity".to_string(), 2)]),
        axis_coordinates: BTreeMap::new(),
    }
}

pub fn context(nx: u32, ny: u32, nz: u32, nt: u32) -> SessionContext {
    let grid = GridConfig {
        nx,
        ny,
        nz,
        nt,
        x_bounds: [0.0, 0.5],
        y_bounds: [0.0, 0.5],
        z_bounds: [0.0, 0.5],
        t_bounds: [0.0, 1.0],
    };
    let method = QueryMethodConfig {
        dataset_title: "channel".to_string(),
        temporal_method: "none".to_string(),
        spatial_method: "lag4".to_string(),
        spatial_operator: "field".to_string(),
    };
    SessionContext {
        session_id: SessionId::derive(&grid, &method).unwrap(),
        variable: "velocity".to_string(),
        constraints: constraints(),
        method,
        grid,
    }
}

pub fn tunable(limit_range: [u64; 2], starting: u64) -> Tunable {
    Tunable {
        query_limit_range: limit_range,
        starting_query_limit: starting,
        ..Tunable::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Pass,
    Fail,
    /// Never answers.
    Hang,
    /// Answers with one row too few.
    ShortRows,
}

/// Scripted remote service: answers each request with the next step, then `Pass`.
///
/// Values are `x + 10 * column` for each point, so saved rows can be checked.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    script: Arc<Mutex<VecDeque<Step>>>,
    requests: Arc<Mutex<Vec<QueryRequest>>>,
    columns: usize,
}

impl ScriptedClient {
    pub fn new(columns: usize, steps: &[Step]) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.iter().copied().collect())),
            requests: Arc::new(Mutex::new(Vec::new())),
            columns,
        }
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn values_for(points: &[[f64; 3]], columns: usize) -> Vec<f32> {
    points
        .iter()
        .flat_map(|p| (0..columns).map(move |c| (p[0] + 10.0 * c as f64) as f32))
        .collect()
}

impl QueryClient for ScriptedClient {
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Pass);
        let columns: Vec<String> = (0..self.columns).map(|c| format!("c{c}")).collect();
        match step {
            Step::Pass => Ok(QueryResponse {
                values: values_for(&request.points, self.columns),
                columns,
            }),
            Step::ShortRows => Ok(QueryResponse {
                values: values_for(&request.points[1..], self.columns),
                columns,
            }),
            Step::Fail => Err(QueryError::Status {
                status: 503,
                body: "service unavailable".to_string(),
            }),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// In-memory state document with optional injected write failures.
pub struct MemoryStates {
    state: Mutex<SessionState>,
    saves: AtomicUsize,
    fail_saves: bool,
}

impl MemoryStates {
    pub fn new(state: SessionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            saves: AtomicUsize::new(0),
            fail_saves: false,
        })
    }

    pub fn failing(state: SessionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            saves: AtomicUsize::new(0),
            fail_saves: true,
        })
    }

    pub fn current(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStates {
    fn load_state(&self) -> Result<SessionState, StoreError> {
        Ok(self.current().resumed())
    }

    fn save_state(&self, state: &SessionState) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only volume",
            )));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = state.clone();
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    chunks: Mutex<Vec<SnapshotChunk>>,
}

impl RecordingSink {
    pub fn chunks(&self) -> Vec<SnapshotChunk> {
        self.chunks.lock().unwrap().clone()
    }
}

impl ChunkSink for RecordingSink {
    fn deliver(&self, chunk: SnapshotChunk) -> Result<(), SinkError> {
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

/// Waits for a status message containing `needle`, returning everything seen so far.
pub async fn wait_for_status(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    needle: &str,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Some(ev) = rx.recv().await {
        let hit = matches!(&ev, SessionEvent::Status(s) if s.contains(needle));
        seen.push(ev);
        if hit {
            break;
        }
    }
    seen
}
