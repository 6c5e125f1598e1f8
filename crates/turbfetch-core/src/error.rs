use std::fmt;

use thiserror::Error;

use crate::types::Axis;

/// Requested vs. available point count on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisShortfall {
    pub axis: Axis,
    pub requested: u64,
    pub available: u64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpatialResolutionError {
    #[error("selected spatial bounds do not lie within the dataset domain on axes: {}", axis_list(.axes))]
    OutOfDomain { axes: Vec<Axis> },
    #[error("at least one grid point is required on axes: {}", axis_list(.axes))]
    NoPoints { axes: Vec<Axis> },
    #[error("quantity of points exceeds the maximum resolution on axes: {}", ShortfallTable(.shortfalls))]
    ExceedsMaxResolution { shortfalls: Vec<AxisShortfall> },
    #[error("selected grid resolution exceeds available indices on axes: {}", ShortfallTable(.shortfalls))]
    ExceedsAvailableIndices { shortfalls: Vec<AxisShortfall> },
}

/// Configuration/validation failures. Raised before the query loop starts; never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridError {
    #[error("spatial resolution error: {0}")]
    SpatialResolution(#[from] SpatialResolutionError),
    #[error(
        "selected time bounds [{start}, {end}] do not exist inside possible domain [{domain_start}, {domain_end}]"
    )]
    InvalidTimeBound {
        start: f64,
        end: f64,
        domain_start: f64,
        domain_end: f64,
    },
    #[error("selected number of time points {requested} is invalid; max existing time points: {max}")]
    InvalidTimePointQuantity { requested: u32, max: u32 },
    #[error(
        "number of time steps {requested} between bounds [{start}, {end}] not possible with a minimum timestep of {min_dt} ({unique} distinct indices)"
    )]
    TimeResolution {
        requested: u32,
        unique: usize,
        start: f64,
        end: f64,
        min_dt: f64,
    },
    #[error(
        "rounded time bounds do not contain enough distinct time points (start index {start_index}, end index {end_index})"
    )]
    NotEnoughTimeIndices { start_index: i64, end_index: i64 },
}

fn axis_list(axes: &[Axis]) -> String {
    axes.iter()
        .map(|a| a.label())
        .collect::<Vec<_>>()
        .join(", ")
}

struct ShortfallTable<'a>(&'a [AxisShortfall]);

impl fmt::Display for ShortfallTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes: Vec<&str> = self.0.iter().map(|s| s.axis.label()).collect();
        let requested: Vec<String> = self.0.iter().map(|s| s.requested.to_string()).collect();
        let available: Vec<String> = self.0.iter().map(|s| s.available.to_string()).collect();
        write!(
            f,
            "{}; selected number of grid points: [{}]; available grid points: [{}]",
            axes.join(", "),
            requested.join(", "),
            available.join(", ")
        )
    }
}
