//! Task admission and execution: the priority queue with entity exclusivity,
//! the worker pool draining it, and bulk submission on top.

pub(crate) mod backoff;
pub mod bulk;
pub mod queue;
pub mod task;
pub(crate) mod worker_pool;
