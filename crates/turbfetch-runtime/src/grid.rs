use turbfetch_core::error::{AxisShortfall, GridError, SpatialResolutionError};
use turbfetch_core::types::{linspace, Axis, ChunkRange, DatasetConstraints, GridConfig};

/// Values this close to an integer are treated as that integer before rounding
/// time bounds onto the canonical axis.
const INDEX_SNAP_EPS: f64 = 1e-9;

/// The validated query domain.
///
/// Spatial points are not materialized: index `i` of the flattened sequence maps to
/// `(x[i / (ny*nz)], y[(i / nz) % ny], z[i % nz])`, i.e. x outermost, z innermost.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    xs: Vec<f64>,
    ys: Vec<f64>,
    zs: Vec<f64>,
    time_indices: Vec<u64>,
    times: Vec<f64>,
}

impl Grid {
    pub fn num_spatial_points(&self) -> u64 {
        self.xs.len() as u64 * self.ys.len() as u64 * self.zs.len() as u64
    }

    pub fn shape(&self) -> [u32; 3] {
        [self.xs.len() as u32, self.ys.len() as u32, self.zs.len() as u32]
    }

    pub fn axis_values(&self, axis: Axis) -> &[f64] {
        match axis {
            Axis::X => &self.xs,
            Axis::Y => &self.ys,
            Axis::Z => &self.zs,
        }
    }

    pub fn point(&self, index: u64) -> Option<[f64; 3]> {
        if index >= self.num_spatial_points() {
            return None;
        }
        let ny = self.ys.len() as u64;
        let nz = self.zs.len() as u64;
        let ix = (index / (ny * nz)) as usize;
        let iy = ((index / nz) % ny) as usize;
        let iz = (index % nz) as usize;
        Some([self.xs[ix], self.ys[iy], self.zs[iz]])
    }

    /// Points of `range`, clipped to the grid.
    pub fn points(&self, range: ChunkRange) -> Vec<[f64; 3]> {
        let end = range.end.min(self.num_spatial_points());
        (range.start..end).filter_map(|i| self.point(i)).collect()
    }

    pub fn iter_points(&self) -> impl Iterator<Item = [f64; 3]> + '_ {
        (0..self.num_spatial_points()).filter_map(|i| self.point(i))
    }

    pub fn nt(&self) -> u32 {
        self.times.len() as u32
    }

    /// Absolute snapshot times, strictly increasing.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Indices of `times` on the canonical fixed-step axis.
    pub fn time_indices(&self) -> &[u64] {
        &self.time_indices
    }
}

/// Validates a [`GridConfig`] against [`DatasetConstraints`] and materializes the
/// per-axis coordinates and snapshot times.
#[derive(Debug, Clone, Copy)]
pub struct GridBuilder<'a> {
    constraints: &'a DatasetConstraints,
    config: &'a GridConfig,
}

impl<'a> GridBuilder<'a> {
    pub fn new(constraints: &'a DatasetConstraints, config: &'a GridConfig) -> Self {
        Self {
            constraints,
            config,
        }
    }

    pub fn build(&self) -> Result<Grid, GridError> {
        let [xs, ys, zs] = self.spatial_axes()?;
        let (time_indices, times) = self.temporal()?;
        Ok(Grid {
            xs,
            ys,
            zs,
            time_indices,
            times,
        })
    }

    /// Checks run in order and stop at the first failing category; every offending
    /// axis of that category is reported.
    pub fn validate_spatial(&self) -> Result<(), SpatialResolutionError> {
        let out_of_domain: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|&axis| {
                let [lo, hi] = self.config.bounds(axis);
                let [dlo, dhi] = self.constraints.domain(axis);
                !(lo.is_finite() && hi.is_finite()) || lo < dlo || hi > dhi || hi <= lo
            })
            .collect();
        if !out_of_domain.is_empty() {
            return Err(SpatialResolutionError::OutOfDomain {
                axes: out_of_domain,
            });
        }

        let no_points: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|&axis| self.config.points(axis) == 0)
            .collect();
        if !no_points.is_empty() {
            return Err(SpatialResolutionError::NoPoints { axes: no_points });
        }

        let over_max: Vec<AxisShortfall> = Axis::ALL
            .into_iter()
            .filter(|&axis| self.config.points(axis) > self.constraints.max_resolution(axis))
            .map(|axis| AxisShortfall {
                axis,
                requested: u64::from(self.config.points(axis)),
                available: u64::from(self.constraints.max_resolution(axis)),
            })
            .collect();
        if !over_max.is_empty() {
            return Err(SpatialResolutionError::ExceedsMaxResolution {
                shortfalls: over_max,
            });
        }

        let too_constrained: Vec<AxisShortfall> = Axis::ALL
            .into_iter()
            .filter_map(|axis| {
                let available = self.available_indices(axis);
                let requested = u64::from(self.config.points(axis));
                (requested > available).then_some(AxisShortfall {
                    axis,
                    requested,
                    available,
                })
            })
            .collect();
        if !too_constrained.is_empty() {
            return Err(SpatialResolutionError::ExceedsAvailableIndices {
                shortfalls: too_constrained,
            });
        }
        Ok(())
    }

    /// Dataset sample indices between the samples nearest to the requested bounds.
    fn available_indices(&self, axis: Axis) -> u64 {
        let coords = self.constraints.sample_coordinates(axis);
        let [lo, hi] = self.config.bounds(axis);
        match (nearest_index(&coords, lo), nearest_index(&coords, hi)) {
            (Some(start), Some(end)) => end.saturating_sub(start) as u64,
            _ => 0,
        }
    }

    pub fn spatial_axes(&self) -> Result<[Vec<f64>; 3], GridError> {
        self.validate_spatial()?;
        Ok(Axis::ALL.map(|axis| {
            let [lo, hi] = self.config.bounds(axis);
            linspace(lo, hi, self.config.points(axis) as usize)
        }))
    }

    /// Snapshot indices on the canonical time axis and their absolute times.
    pub fn temporal(&self) -> Result<(Vec<u64>, Vec<f64>), GridError> {
        let c = self.constraints;
        let nt = self.config.nt;
        let [t_start, t_end] = self.config.t_bounds;
        let bound_err = || GridError::InvalidTimeBound {
            start: t_start,
            end: t_end,
            domain_start: c.domain_t[0],
            domain_end: c.domain_t[1],
        };

        if !(t_start.is_finite() && t_end.is_finite())
            || t_start < c.domain_t[0]
            || t_end > c.domain_t[1]
        {
            return Err(bound_err());
        }
        if nt == 0 || nt > c.max_time_indices {
            return Err(GridError::InvalidTimePointQuantity {
                requested: nt,
                max: c.max_time_indices,
            });
        }
        if !(c.min_dt.is_finite() && c.min_dt > 0.0) {
            return Err(GridError::TimeResolution {
                requested: nt,
                unique: 0,
                start: t_start,
                end: t_end,
                min_dt: c.min_dt,
            });
        }

        let i_start = snap(t_start / c.min_dt).ceil() as i64;
        let i_end = snap(t_end / c.min_dt).floor() as i64;
        if i_start < 0 || i_end >= i64::from(c.max_time_indices) {
            return Err(bound_err());
        }

        // Truncating cast, matching integer linspace semantics.
        let indices: Vec<i64> = linspace(i_start as f64, i_end as f64, nt as usize)
            .into_iter()
            .map(|v| v as i64)
            .collect();
        let mut unique = indices.clone();
        unique.sort_unstable();
        unique.dedup();
        if unique.len() < indices.len() {
            return Err(GridError::TimeResolution {
                requested: nt,
                unique: unique.len(),
                start: t_start,
                end: t_end,
                min_dt: c.min_dt,
            });
        }
        if i_end <= i_start {
            return Err(GridError::NotEnoughTimeIndices {
                start_index: i_start,
                end_index: i_end,
            });
        }

        let indices: Vec<u64> = indices.into_iter().map(|i| i.max(0) as u64).collect();
        let times = indices.iter().map(|&i| i as f64 * c.min_dt).collect();
        Ok((indices, times))
    }
}

fn snap(v: f64) -> f64 {
    let r = v.round();
    if (v - r).abs() < INDEX_SNAP_EPS {
        r
    } else {
        v
    }
}

/// First index minimizing `|coords[i] - value|`.
fn nearest_index(coords: &[f64], value: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &c) in coords.iter().enumerate() {
        let d = (c - value).abs();
        match best {
            Some((_, bd)) if d >= bd => {}
            _ => best = Some((i, d)),
        }
    }
    best.map(|(i, _)| i)
}
