use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operating parameters of the query loop; adjustable between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunable {
    pub query_limit_range: [u64; 2],
    pub query_history_length: usize,
    pub query_limit_update_factor: f64,
    pub starting_query_limit: u64,
    pub wait_update_factor: f64,
    /// Seconds.
    pub wait_range: [f64; 2],
    pub wait_update_padding: u32,
    pub max_consecutive_fails: u32,
}

impl Default for Tunable {
    fn default() -> Self {
        Self {
            query_limit_range: [100, 4000],
            query_history_length: 10,
            query_limit_update_factor: 0.3,
            starting_query_limit: 4000,
            wait_update_factor: 1.5,
            wait_range: [1.0, 3600.0],
            wait_update_padding: 3,
            max_consecutive_fails: 20,
        }
    }
}

/// Hard rails: every `Tunable` field must stay inside its `[min, max]` pair here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Absolute {
    pub query_min_size_limits: [u64; 2],
    pub query_max_size_limits: [u64; 2],
    pub query_limit_update_factor_limits: [f64; 2],
    pub query_history_length_limits: [usize; 2],
    pub wait_max_limits: [f64; 2],
    pub wait_min_limits: [f64; 2],
    pub wait_update_padding_limits: [u32; 2],
    pub wait_time_update_factor_limits: [f64; 2],
    pub max_consecutive_fails_limits: [u32; 2],
}

impl Default for Absolute {
    fn default() -> Self {
        Self {
            query_min_size_limits: [1, 3_999_999],
            query_max_size_limits: [2, 4_000_000],
            query_limit_update_factor_limits: [0.2, 0.6],
            query_history_length_limits: [3, 10],
            wait_max_limits: [2.0, 43_200.0],
            wait_min_limits: [1.0, 42_199.0],
            wait_update_padding_limits: [1, 5],
            wait_time_update_factor_limits: [1.5, 3.0],
            max_consecutive_fails_limits: [1, 100],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tunable: Tunable,
    pub absolute: Absolute,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeConfigError {
    #[error("{field} = {value} lies outside its absolute range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },
    #[error("{field} minimum {min} exceeds maximum {max}")]
    InvertedRange {
        field: &'static str,
        min: String,
        max: String,
    },
}

/// One correction applied by [`RuntimeConfig::sanitize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub field: &'static str,
    pub from: String,
    pub to: String,
}

fn check<T: PartialOrd + ToString + Copy>(
    errors: &mut Vec<RuntimeConfigError>,
    field: &'static str,
    value: T,
    limits: [T; 2],
) {
    if value < limits[0] || value > limits[1] {
        errors.push(RuntimeConfigError::OutOfRange {
            field,
            value: value.to_string(),
            min: limits[0].to_string(),
            max: limits[1].to_string(),
        });
    }
}

fn clamp_into<T: PartialOrd + ToString + Copy>(
    corrections: &mut Vec<Correction>,
    field: &'static str,
    value: &mut T,
    limits: [T; 2],
) {
    let clamped = if *value < limits[0] {
        limits[0]
    } else if *value > limits[1] {
        limits[1]
    } else {
        return;
    };
    corrections.push(Correction {
        field,
        from: value.to_string(),
        to: clamped.to_string(),
    });
    *value = clamped;
}

impl RuntimeConfig {
    /// Reports every violated rail without correcting anything.
    pub fn validate(&self) -> Result<(), Vec<RuntimeConfigError>> {
        let t = &self.tunable;
        let a = &self.absolute;
        let mut errors = Vec::new();

        check(&mut errors, "query_limit_range[0]", t.query_limit_range[0], a.query_min_size_limits);
        check(&mut errors, "query_limit_range[1]", t.query_limit_range[1], a.query_max_size_limits);
        if t.query_limit_range[0] > t.query_limit_range[1] {
            errors.push(RuntimeConfigError::InvertedRange {
                field: "query_limit_range",
                min: t.query_limit_range[0].to_string(),
                max: t.query_limit_range[1].to_string(),
            });
        }
        check(
            &mut errors,
            "starting_query_limit",
            t.starting_query_limit,
            t.query_limit_range,
        );
        check(
            &mut errors,
            "query_limit_update_factor",
            t.query_limit_update_factor,
            a.query_limit_update_factor_limits,
        );
        check(
            &mut errors,
            "query_history_length",
            t.query_history_length,
            a.query_history_length_limits,
        );
        check(&mut errors, "wait_range[0]", t.wait_range[0], a.wait_min_limits);
        check(&mut errors, "wait_range[1]", t.wait_range[1], a.wait_max_limits);
        if t.wait_range[0] > t.wait_range[1] {
            errors.push(RuntimeConfigError::InvertedRange {
                field: "wait_range",
                min: t.wait_range[0].to_string(),
                max: t.wait_range[1].to_string(),
            });
        }
        check(
            &mut errors,
            "wait_update_factor",
            t.wait_update_factor,
            a.wait_time_update_factor_limits,
        );
        check(
            &mut errors,
            "wait_update_padding",
            t.wait_update_padding,
            a.wait_update_padding_limits,
        );
        check(
            &mut errors,
            "max_consecutive_fails",
            t.max_consecutive_fails,
            a.max_consecutive_fails_limits,
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Forces every tunable field into its rails and returns what was changed.
    ///
    /// Inverted min/max pairs collapse onto the maximum, then `starting_query_limit`
    /// is pulled into the (corrected) query size range.
    pub fn sanitize(&mut self) -> Vec<Correction> {
        let a = self.absolute.clone();
        let t = &mut self.tunable;
        let mut corrections = Vec::new();

        clamp_into(
            &mut corrections,
            "query_limit_range[0]",
            &mut t.query_limit_range[0],
            a.query_min_size_limits,
        );
        clamp_into(
            &mut corrections,
            "query_limit_range[1]",
            &mut t.query_limit_range[1],
            a.query_max_size_limits,
        );
        if t.query_limit_range[0] > t.query_limit_range[1] {
            let max = t.query_limit_range[1];
            clamp_into(
                &mut corrections,
                "query_limit_range[0]",
                &mut t.query_limit_range[0],
                [max, max],
            );
        }
        let range = t.query_limit_range;
        clamp_into(
            &mut corrections,
            "starting_query_limit",
            &mut t.starting_query_limit,
            range,
        );
        clamp_into(
            &mut corrections,
            "query_limit_update_factor",
            &mut t.query_limit_update_factor,
            a.query_limit_update_factor_limits,
        );
        clamp_into(
            &mut corrections,
            "query_history_length",
            &mut t.query_history_length,
            a.query_history_length_limits,
        );
        clamp_into(
            &mut corrections,
            "wait_range[0]",
            &mut t.wait_range[0],
            a.wait_min_limits,
        );
        clamp_into(
            &mut corrections,
            "wait_range[1]",
            &mut t.wait_range[1],
            a.wait_max_limits,
        );
        if t.wait_range[0] > t.wait_range[1] {
            let max = t.wait_range[1];
            clamp_into(&mut corrections, "wait_range[0]", &mut t.wait_range[0], [max, max]);
        }
        clamp_into(
            &mut corrections,
            "wait_update_factor",
            &mut t.wait_update_factor,
            a.wait_time_update_factor_limits,
        );
        clamp_into(
            &mut corrections,
            "wait_update_padding",
            &mut t.wait_update_padding,
            a.wait_update_padding_limits,
        );
        clamp_into(
            &mut corrections,
            "max_consecutive_fails",
            &mut t.max_consecutive_fails,
            a.max_consecutive_fails_limits,
        );

        corrections
    }
}
