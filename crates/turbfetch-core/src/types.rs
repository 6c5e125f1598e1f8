use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the canonical fixed-step time axis every dataset exposes.
pub const DEFAULT_MAX_TIME_INDICES: u32 = 4000;

fn default_max_time_indices() -> u32 {
    DEFAULT_MAX_TIME_INDICES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn label(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Evenly spaced samples over `[start, end]`, endpoint included.
///
/// `n == 1` yields `[start]`; `n == 0` yields an empty vector.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            let mut out: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            if let Some(last) = out.last_mut() {
                *last = end;
            }
            out
        }
    }
}

/// Immutable per-dataset limits.
///
/// Field names match the dataset metadata documents the sessions are created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConstraints {
    pub min_dt: f64,
    pub domain_x: [f64; 2],
    pub domain_y: [f64; 2],
    pub domain_z: [f64; 2],
    pub domain_t: [f64; 2],
    pub max_res_x: u32,
    pub max_res_y: u32,
    pub max_res_z: u32,
    #[serde(default = "default_max_time_indices")]
    pub max_time_indices: u32,
    pub dataset_variables: Vec<String>,
    pub variable_components: BTreeMap<String, usize>,
    /// Explicit sample coordinates for non-uniformly sampled axes (e.g. wall-refined
    /// channel flow). Axes without an entry are uniform over their domain.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub axis_coordinates: BTreeMap<Axis, Vec<f64>>,
}

impl DatasetConstraints {
    pub fn domain(&self, axis: Axis) -> [f64; 2] {
        match axis {
            Axis::X => self.domain_x,
            Axis::Y => self.domain_y,
            Axis::Z => self.domain_z,
        }
    }

    pub fn max_resolution(&self, axis: Axis) -> u32 {
        match axis {
            Axis::X => self.max_res_x,
            Axis::Y => self.max_res_y,
            Axis::Z => self.max_res_z,
        }
    }

    /// All dataset sample coordinates along `axis`, ascending.
    pub fn sample_coordinates(&self, axis: Axis) -> Vec<f64> {
        if let Some(coords) = self.axis_coordinates.get(&axis) {
            return coords.clone();
        }
        let [start, end] = self.domain(axis);
        linspace(start, end, self.max_resolution(axis) as usize)
    }

    pub fn component_count(&self, variable: &str) -> Option<usize> {
        self.variable_components.get(variable).copied()
    }
}

/// Immutable per-session request: bounds and point counts on every axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
    pub nt: u32,
    pub x_bounds: [f64; 2],
    pub y_bounds: [f64; 2],
    pub z_bounds: [f64; 2],
    pub t_bounds: [f64; 2],
}

impl GridConfig {
    pub fn bounds(&self, axis: Axis) -> [f64; 2] {
        match axis {
            Axis::X => self.x_bounds,
            Axis::Y => self.y_bounds,
            Axis::Z => self.z_bounds,
        }
    }

    pub fn points(&self, axis: Axis) -> u32 {
        match axis {
            Axis::X => self.nx,
            Axis::Y => self.ny,
            Axis::Z => self.nz,
        }
    }

    pub fn num_spatial_points(&self) -> u64 {
        u64::from(self.nx) * u64::from(self.ny) * u64::from(self.nz)
    }
}

/// Method names forwarded verbatim to the remote query service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMethodConfig {
    pub dataset_title: String,
    pub temporal_method: String,
    pub spatial_method: String,
    pub spatial_operator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64, // half-open [start, end)
}

impl ChunkRange {
    /// The next chunk after `resume_index`, at most `limit` points, never past `total`.
    pub fn plan(resume_index: u64, limit: u64, total: u64) -> Self {
        let start = resume_index.min(total);
        let end = resume_index.saturating_add(limit).min(total);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start <= index && index < self.end
    }

    pub fn reaches(&self, total: u64) -> bool {
        self.end == total
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Stable identity of a session: SHA-256 over the grid and method configs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn derive(grid: &GridConfig, method: &QueryMethodConfig) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_vec(&(grid, method))?;
        Ok(Self(hex::encode(Sha256::digest(&canonical))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
