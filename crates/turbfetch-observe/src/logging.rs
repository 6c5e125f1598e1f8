use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `TURBFETCH_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for the query loop:
/// - Every session-loop event uses target `turbfetch_session` and an `event` field.
/// - Include `session_id` and `variable` on the span that wraps a run.
/// - Chunk events carry `range` as `[start, end)`; snapshot events carry `temporal_index`.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("TURBFETCH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
