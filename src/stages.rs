//! Stage definitions: the invocation contract, the declarative catalog,
//! the implementation registry and the planner.

pub mod catalog;
pub mod contract;
pub mod planner;
pub mod registry;
