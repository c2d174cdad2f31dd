//! The bounded work queue and Background Job Pool: a fixed-size worker
//! pool dispatching chunk operations to pluggable collaborators, with a
//! self-pipe wakeup descriptor a single-threaded reactor can poll.

pub mod pool;
pub mod queue;
pub mod wakeup;

pub use pool::{Callback, JobOp, JobPool, JobResult, ERROR_EINVAL};
pub use queue::BoundedQueue;
