#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod control;
pub mod events;
pub mod grid;
pub mod metrics;
pub mod orchestrator;
pub mod sink;
