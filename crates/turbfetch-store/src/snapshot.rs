//! Per-snapshot array store.
//!
//! Each snapshot (one temporal index of one variable) is a directory holding
//! `array.json` (the header) and `array.f32`, a pre-sized row-major little-endian
//! `f32` matrix of shape `(num_rows, columns)`. Chunks write into their row slice.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use turbfetch_core::types::{Axis, ChunkRange, SessionId};

use crate::{read_json, write_json_atomic, StoreError};

pub const HEADER_FILE: &str = "array.json";
pub const DATA_FILE: &str = "array.f32";
pub const ELEMENT_TYPE: &str = "float32";

/// Attributes of one snapshot, fixed for every chunk written into it.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    pub variable: String,
    pub temporal_index: u32,
    pub nt: u32,
    pub snapshot_time: f64,
    pub grid_shape: [u32; 3],
    pub num_rows: u64,
    pub dataset_title: String,
    pub temporal_method: String,
    pub spatial_method: String,
    pub spatial_operator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub variable: String,
    pub shape: [u64; 2],
    pub element_type: String,
    pub columns: Vec<String>,
    pub axes: Vec<String>,
    pub grid_shape: [u32; 3],
    pub snapshot_time: f64,
    pub temporal_index: u32,
    pub nt: u32,
    pub value_min: Option<f32>,
    pub value_max: Option<f32>,
    pub dataset_title: String,
    pub temporal_method: String,
    pub spatial_method: String,
    pub spatial_operator: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWrite {
    pub dir: PathBuf,
    /// `true` when this chunk created the snapshot store.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
    session: SessionId,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>, session: SessionId) -> Self {
        Self {
            root: root.into(),
            session,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_dir(&self, temporal_index: u32, nt: u32) -> PathBuf {
        self.root.join(format!(
            "t={}_of_nt={}__hash={}",
            u64::from(temporal_index) + 1,
            nt,
            self.session.short()
        ))
    }

    pub fn read_header(&self, temporal_index: u32, nt: u32) -> Result<Option<SnapshotHeader>, StoreError> {
        read_json(&self.snapshot_dir(temporal_index, nt).join(HEADER_FILE))
    }

    /// Writes `values` (row-major, `columns.len()` per row) into rows `range`.
    pub fn write_chunk(
        &self,
        meta: &SnapshotMeta,
        columns: &[String],
        range: ChunkRange,
        values: &[f32],
    ) -> Result<ChunkWrite, StoreError> {
        let dir = self.snapshot_dir(meta.temporal_index, meta.nt);
        let header_path = dir.join(HEADER_FILE);
        let data_path = dir.join(DATA_FILE);
        let width = columns.len() as u64;

        if width == 0 || values.len() as u64 != range.len() * width {
            return Err(snapshot_err(
                &dir,
                format!(
                    "chunk {range} carries {} values for {} columns",
                    values.len(),
                    columns.len()
                ),
            ));
        }
        if range.end > meta.num_rows {
            return Err(snapshot_err(
                &dir,
                format!("chunk {range} exceeds {} rows", meta.num_rows),
            ));
        }

        let (chunk_min, chunk_max) = value_range(values);
        let (mut header, created) = match read_json::<SnapshotHeader>(&header_path)? {
            Some(header) => {
                if header.shape[1] != width {
                    return Err(snapshot_err(
                        &dir,
                        format!(
                            "component count mismatch: store has {}, chunk has {}",
                            header.shape[1], width
                        ),
                    ));
                }
                (header, false)
            }
            None => {
                std::fs::create_dir_all(&dir)?;
                let f = std::fs::OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(&data_path)?;
                f.set_len(meta.num_rows * width * 4)?;
                f.sync_all()?;
                (new_header(meta, columns), true)
            }
        };

        let widened_min = min_opt(header.value_min, chunk_min);
        let widened_max = max_opt(header.value_max, chunk_max);
        let header_changed =
            created || widened_min != header.value_min || widened_max != header.value_max;
        header.value_min = widened_min;
        header.value_max = widened_max;

        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut f = std::fs::OpenOptions::new().write(true).open(&data_path)?;
        f.seek(SeekFrom::Start(range.start * width * 4))?;
        f.write_all(&bytes)?;
        f.sync_data()?;

        if header_changed {
            write_json_atomic(&header_path, &header)?;
        }
        Ok(ChunkWrite { dir, created })
    }

    /// Reads back rows `range` of a snapshot.
    pub fn read_rows(
        &self,
        temporal_index: u32,
        nt: u32,
        range: ChunkRange,
    ) -> Result<Vec<f32>, StoreError> {
        use std::io::Read;

        let dir = self.snapshot_dir(temporal_index, nt);
        let header = read_json::<SnapshotHeader>(&dir.join(HEADER_FILE))?
            .ok_or_else(|| snapshot_err(&dir, "snapshot does not exist".to_string()))?;
        if range.end > header.shape[0] {
            return Err(snapshot_err(
                &dir,
                format!("rows {range} exceed {} rows", header.shape[0]),
            ));
        }
        let width = header.shape[1];
        let mut f = std::fs::File::open(dir.join(DATA_FILE))?;
        f.seek(SeekFrom::Start(range.start * width * 4))?;
        let mut buf = vec![0u8; (range.len() * width * 4) as usize];
        f.read_exact(&mut buf)?;
        Ok(buf
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

fn new_header(meta: &SnapshotMeta, columns: &[String]) -> SnapshotHeader {
    SnapshotHeader {
        variable: meta.variable.clone(),
        shape: [meta.num_rows, columns.len() as u64],
        element_type: ELEMENT_TYPE.to_string(),
        columns: columns.to_vec(),
        axes: Axis::ALL.iter().map(|a| a.label().to_string()).collect(),
        grid_shape: meta.grid_shape,
        snapshot_time: meta.snapshot_time,
        temporal_index: meta.temporal_index,
        nt: meta.nt,
        value_min: None,
        value_max: None,
        dataset_title: meta.dataset_title.clone(),
        temporal_method: meta.temporal_method.clone(),
        spatial_method: meta.spatial_method.clone(),
        spatial_operator: meta.spatial_operator.clone(),
    }
}

fn snapshot_err(dir: &Path, reason: String) -> StoreError {
    StoreError::Snapshot {
        path: dir.to_path_buf(),
        reason,
    }
}

// NaN never widens the range.
fn value_range(values: &[f32]) -> (Option<f32>, Option<f32>) {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold((None, None), |(lo, hi), v| {
            (min_opt(lo, Some(v)), max_opt(hi, Some(v)))
        })
}

fn min_opt(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn max_opt(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
