use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Fixed loop flags persisted alongside the cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFlags {
    pub is_first_chunk: bool,
    pub is_last_chunk: bool,
    pub snapshot_is_complete: bool,
    pub series_is_complete: bool,
    pub is_new_series: bool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            is_first_chunk: true,
            is_last_chunk: false,
            snapshot_is_complete: false,
            series_is_complete: false,
            is_new_series: true,
        }
    }
}

/// The persisted cursor/history record for one (session, variable) pair.
///
/// This is the only resume authority: a restarted loop continues from
/// `resume_temporal_index` / `resume_volume_index` exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub resume_volume_index: u64,
    pub resume_temporal_index: u32,
    pub current_query_limit: f64,
    /// Oldest first. Bounded by `Tunable::query_history_length`.
    pub query_history: VecDeque<bool>,
    #[serde(default)]
    pub num_consecutive_fails: u32,
    #[serde(default)]
    pub flags: SessionFlags,
}

impl SessionState {
    pub fn new(starting_query_limit: u64) -> Self {
        Self {
            resume_volume_index: 0,
            resume_temporal_index: 0,
            current_query_limit: starting_query_limit as f64,
            query_history: VecDeque::new(),
            num_consecutive_fails: 0,
            flags: SessionFlags::default(),
        }
    }

    /// Normalizes a state read back from disk: the failure streak always restarts at zero.
    pub fn resumed(mut self) -> Self {
        self.num_consecutive_fails = 0;
        self
    }

    /// Whole points the next chunk may request.
    pub fn chunk_limit(&self) -> u64 {
        if self.current_query_limit.is_finite() && self.current_query_limit >= 1.0 {
            self.current_query_limit.floor() as u64
        } else {
            1
        }
    }

    pub fn record_outcome(&mut self, passed: bool, history_length: usize) {
        self.query_history.push_back(passed);
        while self.query_history.len() > history_length {
            self.query_history.pop_front();
        }
    }

    /// Moves the cursor past a finished snapshot.
    ///
    /// Returns `true` when that snapshot was the last one and the series is now complete.
    pub fn advance_snapshot(&mut self, nt: u32) -> bool {
        self.resume_temporal_index = self.resume_temporal_index.saturating_add(1).min(nt);
        self.resume_volume_index = 0;
        self.flags.is_first_chunk = true;
        self.flags.is_last_chunk = false;
        if self.resume_temporal_index >= nt {
            self.flags.series_is_complete = true;
            true
        } else {
            self.flags.snapshot_is_complete = false;
            false
        }
    }
}
