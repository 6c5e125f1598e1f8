use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio::sync::mpsc;
use tracing::{info_span, Instrument};
use turbfetch_runtime::client::{HttpClientConfig, HttpQueryClient};
use turbfetch_runtime::events::{SessionEvent, SessionHandle};
use turbfetch_runtime::orchestrator::{
    QueryOrchestrator, SessionContext, SessionError, SessionOutcome,
};
use turbfetch_store::config::load_runtime_config;
use turbfetch_store::layout::DataRoot;
use turbfetch_store::lock::RunLockGuard;
use turbfetch_store::session::open_session;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Session id or a unique prefix of one.
    session: String,

    variable: String,

    #[arg(long, env = "TURBFETCH_ENDPOINT", default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    #[arg(long, env = "TURBFETCH_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    #[arg(long, env = "TURBFETCH_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    connect_timeout_ms: u64,

    #[arg(long, env = "TURBFETCH_REQUEST_TIMEOUT_MS", default_value_t = 300_000)]
    request_timeout_ms: u64,

    /// A run lock whose heartbeat is older than this is taken over. 0 disables takeover.
    #[arg(long, env = "TURBFETCH_RUN_LOCK_STALE_MS", default_value_t = 600_000)]
    run_lock_stale_ms: u64,

    /// Ignore `pause` / `resume` / `stop` lines on stdin.
    #[arg(long, env = "TURBFETCH_NO_STDIN", default_value_t = false)]
    no_stdin: bool,
}

pub async fn run(root: &DataRoot, args: RunArgs) -> Result<()> {
    let session = open_session(root, &args.session)?;
    let (runtime, _) = load_runtime_config(&root.runtime_config_path())?;

    let client = HttpQueryClient::new(&HttpClientConfig {
        endpoint: args.endpoint.clone(),
        auth_token: args.auth_token.clone(),
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
    })
    .map_err(SessionError::from)?;

    let stale_after = Duration::from_millis(args.run_lock_stale_ms);
    let lock = Arc::new(session.lock_variable(&args.variable, stale_after)?);
    session.mark_loaded(&args.variable)?;

    let states = Arc::new(session.state_store(&args.variable)?);
    let sink = Arc::new(session.snapshot_store(&args.variable)?);
    let ctx = SessionContext {
        session_id: session.id().clone(),
        variable: args.variable.clone(),
        constraints: session.configs.dataset_constraints.clone(),
        method: session.configs.query_method_config.clone(),
        grid: session.configs.grid_config.clone(),
    };
    let (orchestrator, handle, events) =
        QueryOrchestrator::new(ctx, runtime.tunable, client, sink, states);

    let span = info_span!(
        "turbfetch-run",
        session_id = %session.id(),
        variable = %args.variable,
        endpoint = %args.endpoint
    );

    async move {
        tracing::info!(
            target: "turbfetch_cli",
            event = "run_start",
            lock = %lock.path().display(),
            "run lock held; starting session loop"
        );

        let heartbeat = tokio::spawn(heartbeat(lock.clone(), stale_after).in_current_span());
        let interrupt = tokio::spawn(stop_on_ctrl_c(handle.clone()).in_current_span());
        if !args.no_stdin {
            read_commands(handle.clone());
        }
        let reporter = tokio::spawn(report(events).in_current_span());

        let outcome = tokio::spawn(orchestrator.run().in_current_span()).await?;
        heartbeat.abort();
        interrupt.abort();
        let _ = heartbeat.await;
        // The loop dropped its event sender, so the reporter drains and exits.
        reporter.await?;

        match outcome? {
            SessionOutcome::Completed => {
                session.mark_completed(&args.variable)?;
                tracing::info!(
                    target: "turbfetch_cli",
                    event = "run_complete",
                    "every snapshot of the series is saved"
                );
            }
            SessionOutcome::Stopped => {
                tracing::info!(
                    target: "turbfetch_cli",
                    event = "run_stopped",
                    "session stopped; rerun to resume from the saved cursor"
                );
            }
        }
        drop(lock);
        Ok(())
    }
    .instrument(span)
    .await
}

async fn heartbeat(lock: Arc<RunLockGuard>, stale_after: Duration) {
    if stale_after.is_zero() {
        return;
    }
    let mut tick = tokio::time::interval((stale_after / 3).max(Duration::from_secs(1)));
    tick.tick().await;
    loop {
        tick.tick().await;
        let lock = lock.clone();
        let touched = tokio::task::spawn_blocking(move || lock.touch()).await;
        match touched {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                target: "turbfetch_cli",
                event = "run_lock_heartbeat_failed",
                error = %err,
                "could not refresh run lock"
            ),
            Err(err) => tracing::warn!(
                target: "turbfetch_cli",
                event = "run_lock_heartbeat_failed",
                error = %err,
                "heartbeat task failed"
            ),
        }
    }
}

async fn stop_on_ctrl_c(handle: SessionHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!(target: "turbfetch_cli", event = "ctrl_c", "stop requested");
        handle.stop();
    }
}

/// Feeds stdin lines to the session controls. The reader thread is detached and dies with the process.
fn read_commands(handle: SessionHandle) {
    let spawned = std::thread::Builder::new()
        .name("turbfetch-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let applied = match line.trim() {
                    "pause" => handle.pause(),
                    "resume" => handle.resume(),
                    "stop" => handle.stop(),
                    "" => continue,
                    other => {
                        tracing::warn!(
                            target: "turbfetch_cli",
                            event = "unknown_command",
                            command = other,
                            "expected pause, resume or stop"
                        );
                        continue;
                    }
                };
                if !applied {
                    tracing::info!(
                        target: "turbfetch_cli",
                        event = "command_ignored",
                        command = line.trim(),
                        control = ?handle.control(),
                        "command does not apply in the current state"
                    );
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(
            target: "turbfetch_cli",
            event = "stdin_unavailable",
            error = %err,
            "stdin controls disabled"
        );
    }
}

async fn report(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::SpatialProgress { done, total } => tracing::info!(
                target: "turbfetch_cli",
                event = "spatial_progress",
                done,
                total,
                percent = %format!("{:.1}", percent(done, total)),
            ),
            SessionEvent::TemporalProgress { done, total } => tracing::info!(
                target: "turbfetch_cli",
                event = "temporal_progress",
                done,
                total,
                percent = %format!("{:.1}", percent(u64::from(done), u64::from(total))),
            ),
            SessionEvent::ChunkSaved { range } => tracing::debug!(
                target: "turbfetch_cli",
                event = "chunk_saved",
                range = %range,
            ),
            SessionEvent::SnapshotComplete { temporal_index } => tracing::info!(
                target: "turbfetch_cli",
                event = "snapshot_complete",
                snapshot = temporal_index + 1,
            ),
            SessionEvent::SeriesComplete => {
                tracing::info!(target: "turbfetch_cli", event = "series_complete")
            }
            SessionEvent::Status(message) => {
                tracing::info!(target: "turbfetch_cli", event = "status", "{message}")
            }
            SessionEvent::Error(message) => {
                tracing::error!(target: "turbfetch_cli", event = "error", "{message}")
            }
        }
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}
