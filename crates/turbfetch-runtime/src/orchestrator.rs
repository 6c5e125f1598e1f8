use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use turbfetch_core::config::Tunable;
use turbfetch_core::error::GridError;
use turbfetch_core::state::SessionState;
use turbfetch_core::types::{ChunkRange, DatasetConstraints, GridConfig, QueryMethodConfig, SessionId};
use turbfetch_observe::time::format_hms;
use turbfetch_store::snapshot::SnapshotMeta;
use turbfetch_store::{StateStore, StoreError};

use crate::client::{ClientBuildError, QueryClient, QueryError, QueryRequest, QueryResponse};
use crate::control::{BackoffController, SizeController};
use crate::events::{stopped, Control, SessionEvent, SessionHandle};
use crate::grid::{Grid, GridBuilder};
use crate::metrics::SessionMetrics;
use crate::sink::{ChunkSink, SinkError, SnapshotChunk};

/// Everything that ends a session without completing it. Query failures never appear
/// here: they are retried.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("failed to construct dataset handle: {0}")]
    DatasetHandle(String),
    #[error("variable {variable:?} is not part of dataset {dataset:?}")]
    UnknownVariable { variable: String, dataset: String },
    #[error("state persistence failed: {0}")]
    Persistence(#[source] StoreError),
    #[error("chunk write failed: {0}")]
    Sink(#[from] SinkError),
    #[error("component count mismatch: dataset declares {expected}, response has {got}")]
    ComponentMismatch { expected: usize, got: usize },
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ClientBuildError> for SessionError {
    fn from(err: ClientBuildError) -> Self {
        SessionError::DatasetHandle(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Stopped,
}

/// Immutable description of the (session, variable) pair a loop works on.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub variable: String,
    pub constraints: DatasetConstraints,
    pub method: QueryMethodConfig,
    pub grid: GridConfig,
}

/// The retrieval loop for one (session, variable) pair.
///
/// Owns the [`SessionState`] for its whole run. Callers talk to it only through the
/// [`SessionHandle`] (pause/resume/stop) and the [`SessionEvent`] stream.
pub struct QueryOrchestrator<C> {
    ctx: SessionContext,
    tunable: Tunable,
    client: C,
    sink: Arc<dyn ChunkSink>,
    states: Arc<dyn StateStore>,
    control: watch::Receiver<Control>,
    events: mpsc::UnboundedSender<SessionEvent>,
    metrics: Arc<SessionMetrics>,
}

impl<C: QueryClient> QueryOrchestrator<C> {
    pub fn new(
        ctx: SessionContext,
        tunable: Tunable,
        client: C,
        sink: Arc<dyn ChunkSink>,
        states: Arc<dyn StateStore>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (handle, control) = SessionHandle::new();
        let (events, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            ctx,
            tunable,
            client,
            sink,
            states,
            control,
            events,
            metrics: Arc::new(SessionMetrics::default()),
        };
        (orchestrator, handle, rx)
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        self.metrics.clone()
    }

    /// Runs until the series completes, a stop is requested, or a fatal error occurs.
    pub async fn run(self) -> Result<SessionOutcome, SessionError> {
        let result = self.drive().await;
        let outcome = match &result {
            Ok(SessionOutcome::Completed) => "completed",
            Ok(SessionOutcome::Stopped) => "stopped",
            Err(_) => "failed",
        };
        if let Err(err) = &result {
            tracing::error!(
                target: "turbfetch_session",
                event = "session_failed",
                session_id = %self.ctx.session_id,
                variable = %self.ctx.variable,
                error = %err,
                "session ended with a fatal error"
            );
            self.emit(SessionEvent::Error(err.to_string()));
        }
        self.metrics
            .emit(self.ctx.session_id.as_str(), &self.ctx.variable, outcome);
        result
    }

    async fn drive(&self) -> Result<SessionOutcome, SessionError> {
        let grid = GridBuilder::new(&self.ctx.constraints, &self.ctx.grid).build()?;
        let expected_columns = self
            .ctx
            .constraints
            .component_count(&self.ctx.variable)
            .ok_or_else(|| SessionError::UnknownVariable {
                variable: self.ctx.variable.clone(),
                dataset: self.ctx.method.dataset_title.clone(),
            })?;

        let size = SizeController::from_tunable(&self.tunable);
        let backoff = BackoffController::from_tunable(&self.tunable);
        let history_len = self.tunable.query_history_length;
        let n = grid.num_spatial_points();
        let nt = grid.nt();

        let mut state = self.load_state().await?;
        state.current_query_limit = state.current_query_limit.min(size.max).max(size.min);
        self.metrics.query_limit.set(state.current_query_limit);

        let series_done = state.flags.series_is_complete || state.resume_temporal_index >= nt;
        self.emit(SessionEvent::SpatialProgress {
            done: if series_done {
                n
            } else {
                state.resume_volume_index.min(n)
            },
            total: n,
        });
        self.emit(SessionEvent::TemporalProgress {
            done: state.resume_temporal_index.min(nt),
            total: nt,
        });
        tracing::info!(
            target: "turbfetch_session",
            event = "session_started",
            session_id = %self.ctx.session_id,
            variable = %self.ctx.variable,
            num_spatial_points = n,
            nt,
            resume_volume_index = state.resume_volume_index,
            resume_temporal_index = state.resume_temporal_index,
            query_limit = state.current_query_limit,
            "session started"
        );

        loop {
            if self.stop_requested() {
                return Ok(self.stopped_at(&state));
            }
            if self.control_is(Control::Paused) && !self.wait_while_paused().await {
                return Ok(self.stopped_at(&state));
            }

            if state.flags.series_is_complete || state.resume_temporal_index >= nt {
                if !state.flags.series_is_complete {
                    state.flags.series_is_complete = true;
                    self.persist(&state).await?;
                }
                return Ok(self.completed());
            }

            if state.resume_volume_index >= n {
                // Last chunk was saved but the snapshot never advanced.
                let ti = state.resume_temporal_index;
                state.flags.snapshot_is_complete = true;
                self.emit(SessionEvent::SnapshotComplete { temporal_index: ti });
                state.advance_snapshot(nt);
                self.persist(&state).await?;
                self.emit(SessionEvent::TemporalProgress {
                    done: state.resume_temporal_index,
                    total: nt,
                });
                continue;
            }

            let ti = state.resume_temporal_index;
            let range = ChunkRange::plan(state.resume_volume_index, state.chunk_limit(), n);
            state.flags.is_last_chunk = range.reaches(n);
            let request = self.request(&grid, ti, range);

            tracing::info!(
                target: "turbfetch_session",
                event = "chunk_queried",
                range = %range,
                points = range.len(),
                temporal_index = ti,
                query_limit = state.current_query_limit,
                "querying chunk"
            );
            self.emit(SessionEvent::Status(format!(
                "querying points {}-{} of {} | snapshot {} of {}",
                range.start + 1,
                range.end,
                n,
                ti + 1,
                nt
            )));

            let attempt = tokio::select! {
                r = self.attempt(request, range.len() as usize) => r,
                _ = stopped(self.control.clone()) => {
                    return Ok(self.stopped_at(&state));
                }
            };

            let passed = match attempt {
                Ok(response) => {
                    if response.columns.len() != expected_columns {
                        return Err(SessionError::ComponentMismatch {
                            expected: expected_columns,
                            got: response.columns.len(),
                        });
                    }
                    self.deliver(SnapshotChunk {
                        meta: self.snapshot_meta(&grid, ti),
                        columns: response.columns,
                        range,
                        values: response.values,
                    })
                    .await?;

                    state.resume_volume_index = range.end;
                    state.flags.is_first_chunk = false;
                    state.flags.is_new_series = false;
                    if state.flags.is_last_chunk {
                        state.flags.snapshot_is_complete = true;
                    }
                    self.persist(&state).await?;

                    self.metrics.chunks_saved_total.inc();
                    self.metrics.points_saved_total.inc_by(range.len());
                    tracing::info!(
                        target: "turbfetch_session",
                        event = "chunk_saved",
                        range = %range,
                        temporal_index = ti,
                        "chunk saved"
                    );
                    self.emit(SessionEvent::ChunkSaved { range });
                    self.emit(SessionEvent::SpatialProgress {
                        done: range.end,
                        total: n,
                    });
                    true
                }
                Err(err) => {
                    self.metrics.queries_failed_total.inc();
                    tracing::warn!(
                        target: "turbfetch_session",
                        event = "query_failed",
                        range = %range,
                        temporal_index = ti,
                        consecutive_fails = state.num_consecutive_fails.saturating_add(1),
                        error = %err,
                        "query attempt failed"
                    );
                    false
                }
            };

            state.record_outcome(passed, history_len);
            state.current_query_limit = size.next_limit(&state.query_history, state.current_query_limit);
            self.metrics.query_limit.set(state.current_query_limit);

            if passed {
                backoff.on_success(&mut state.num_consecutive_fails);
                if state.flags.snapshot_is_complete {
                    tracing::info!(
                        target: "turbfetch_session",
                        event = "snapshot_complete",
                        temporal_index = ti,
                        nt,
                        "snapshot complete"
                    );
                    self.emit(SessionEvent::SnapshotComplete { temporal_index: ti });
                    let series_done = state.advance_snapshot(nt);
                    self.persist(&state).await?;
                    self.emit(SessionEvent::TemporalProgress {
                        done: state.resume_temporal_index,
                        total: nt,
                    });
                    if series_done {
                        return Ok(self.completed());
                    }
                    self.emit(SessionEvent::SpatialProgress { done: 0, total: n });
                    continue;
                }
                self.persist(&state).await?;
            } else {
                state.num_consecutive_fails = state.num_consecutive_fails.saturating_add(1);
                let wait = backoff.on_failure(state.num_consecutive_fails);
                if state.num_consecutive_fails == self.tunable.max_consecutive_fails {
                    tracing::warn!(
                        target: "turbfetch_session",
                        event = "consecutive_fail_ceiling",
                        consecutive_fails = state.num_consecutive_fails,
                        "consecutive failure ceiling reached; still retrying"
                    );
                    self.emit(SessionEvent::Status(format!(
                        "{} consecutive failed queries; still retrying",
                        state.num_consecutive_fails
                    )));
                }
                self.persist(&state).await?;

                tracing::info!(
                    target: "turbfetch_session",
                    event = "backoff_wait",
                    wait_secs = wait.as_secs_f64(),
                    consecutive_fails = state.num_consecutive_fails,
                    next_query_limit = state.current_query_limit,
                    "waiting before retry"
                );
                self.emit(SessionEvent::Status(format!(
                    "query failed; waiting {} before retrying",
                    format_hms(wait)
                )));
                if !self.sleep_or_stop(wait).await {
                    return Ok(self.stopped_at(&state));
                }
            }
        }
    }

    fn request(&self, grid: &Grid, temporal_index: u32, range: ChunkRange) -> QueryRequest {
        QueryRequest {
            dataset_title: self.ctx.method.dataset_title.clone(),
            variable: self.ctx.variable.clone(),
            time: grid.times()[temporal_index as usize],
            temporal_method: self.ctx.method.temporal_method.clone(),
            spatial_method: self.ctx.method.spatial_method.clone(),
            spatial_operator: self.ctx.method.spatial_operator.clone(),
            points: grid.points(range),
        }
    }

    fn snapshot_meta(&self, grid: &Grid, temporal_index: u32) -> SnapshotMeta {
        SnapshotMeta {
            variable: self.ctx.variable.clone(),
            temporal_index,
            nt: grid.nt(),
            snapshot_time: grid.times()[temporal_index as usize],
            grid_shape: grid.shape(),
            num_rows: grid.num_spatial_points(),
            dataset_title: self.ctx.method.dataset_title.clone(),
            temporal_method: self.ctx.method.temporal_method.clone(),
            spatial_method: self.ctx.method.spatial_method.clone(),
            spatial_operator: self.ctx.method.spatial_operator.clone(),
        }
    }

    async fn attempt(
        &self,
        request: QueryRequest,
        expected_rows: usize,
    ) -> Result<QueryResponse, QueryError> {
        self.metrics.queries_total.inc();
        let _timer = self.metrics.query_latency.start();
        let response = self.client.query(request).await?;
        response.check_shape(expected_rows)?;
        Ok(response)
    }

    async fn load_state(&self) -> Result<SessionState, SessionError> {
        let states = self.states.clone();
        tokio::task::spawn_blocking(move || states.load_state())
            .await?
            .map_err(SessionError::Persistence)
    }

    async fn persist(&self, state: &SessionState) -> Result<(), SessionError> {
        let states = self.states.clone();
        let snapshot = state.clone();
        tokio::task::spawn_blocking(move || states.save_state(&snapshot))
            .await?
            .map_err(SessionError::Persistence)
    }

    // Sink writes are blocking file I/O.
    async fn deliver(&self, chunk: SnapshotChunk) -> Result<(), SessionError> {
        let sink = self.sink.clone();
        tokio::task::spawn_blocking(move || sink.deliver(chunk)).await??;
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn control_is(&self, c: Control) -> bool {
        *self.control.borrow() == c
    }

    fn stop_requested(&self) -> bool {
        self.control_is(Control::Stopped)
    }

    /// `false` when the pause ended in a stop.
    async fn wait_while_paused(&self) -> bool {
        tracing::info!(
            target: "turbfetch_session",
            event = "session_paused",
            variable = %self.ctx.variable,
            "session paused"
        );
        self.emit(SessionEvent::Status("paused".to_string()));

        let mut rx = self.control.clone();
        let resumed = rx
            .wait_for(|c| *c != Control::Paused)
            .await
            .map(|c| *c == Control::Running)
            .unwrap_or(false);
        if resumed {
            tracing::info!(
                target: "turbfetch_session",
                event = "session_resumed",
                variable = %self.ctx.variable,
                "session resumed"
            );
            self.emit(SessionEvent::Status("resumed".to_string()));
        }
        resumed
    }

    /// `false` when interrupted by a stop.
    async fn sleep_or_stop(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = stopped(self.control.clone()) => false,
        }
    }

    fn stopped_at(&self, state: &SessionState) -> SessionOutcome {
        tracing::info!(
            target: "turbfetch_session",
            event = "session_stopped",
            variable = %self.ctx.variable,
            resume_volume_index = state.resume_volume_index,
            resume_temporal_index = state.resume_temporal_index,
            "session stopped"
        );
        self.emit(SessionEvent::Status("stopped".to_string()));
        SessionOutcome::Stopped
    }

    fn completed(&self) -> SessionOutcome {
        tracing::info!(
            target: "turbfetch_session",
            event = "series_complete",
            session_id = %self.ctx.session_id,
            variable = %self.ctx.variable,
            "series complete"
        );
        self.emit(SessionEvent::Status("series complete".to_string()));
        self.emit(SessionEvent::SeriesComplete);
        SessionOutcome::Completed
    }
}
