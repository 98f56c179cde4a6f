//! Per-entity pipeline execution and the collaborators it reads and writes.

pub mod collaborators;
pub mod memory;
pub mod outcome;
pub mod runner;
