use turbfetch_observe::metrics::{Counter, FloatGauge, LatencyAgg};

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub queries_total: Counter,
    pub queries_failed_total: Counter,
    pub chunks_saved_total: Counter,
    pub points_saved_total: Counter,
    pub query_limit: FloatGauge,
    pub query_latency: LatencyAgg,
}

impl SessionMetrics {
    pub fn emit(&self, session_id: &str, variable: &str, outcome: &str) {
        let latency = self.query_latency.snapshot();
        tracing::info!(
            target: "turbfetch_session",
            event = "metrics",
            session_id,
            variable,
            outcome,
            queries_total = self.queries_total.get(),
            queries_failed_total = self.queries_failed_total.get(),
            chunks_saved_total = self.chunks_saved_total.get(),
            points_saved_total = self.points_saved_total.get(),
            query_limit = self.query_limit.get(),
            query_latency_avg_ms = latency.avg_ms(),
            query_latency_max_ms = latency.max_ms(),
            "session metrics"
        );
    }
}
