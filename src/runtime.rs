//! Runtime glue: configuration, telemetry, and the orchestrator that wires
//! them to the scheduler and the pipeline runner.

pub mod config;
pub mod orchestrator;
pub mod telemetry;
