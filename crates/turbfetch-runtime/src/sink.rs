use thiserror::Error;
use turbfetch_core::types::ChunkRange;
use turbfetch_store::snapshot::{FsSnapshotStore, SnapshotMeta};
use turbfetch_store::StoreError;

/// One successful chunk, ready to be written into its snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotChunk {
    pub meta: SnapshotMeta,
    pub columns: Vec<String>,
    pub range: ChunkRange,
    pub values: Vec<f32>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("chunk rejected: {0}")]
    Rejected(String),
}

/// Destination for query results.
///
/// Synchronous on purpose: the loop runs delivery on a blocking thread and waits for it,
/// so at most one chunk write is ever in flight.
pub trait ChunkSink: Send + Sync + 'static {
    fn deliver(&self, chunk: SnapshotChunk) -> Result<(), SinkError>;
}

impl ChunkSink for FsSnapshotStore {
    fn deliver(&self, chunk: SnapshotChunk) -> Result<(), SinkError> {
        let written = self.write_chunk(&chunk.meta, &chunk.columns, chunk.range, &chunk.values)?;
        if written.created {
            tracing::info!(
                target: "turbfetch_session",
                event = "snapshot_created",
                dir = %written.dir.display(),
                temporal_index = chunk.meta.temporal_index,
                rows = chunk.meta.num_rows,
                columns = chunk.columns.len(),
                "snapshot store created"
            );
        }
        Ok(())
    }
}
