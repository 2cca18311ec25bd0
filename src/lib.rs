#![allow(clippy::result_large_err)]

pub mod artifacts;
pub mod config;
pub mod error;
pub mod metrics;
pub mod migrate;
pub mod orchestrator;
pub mod plan;
pub mod probe;
pub mod process;
pub mod seed;
pub mod telemetry;
pub mod topology;
