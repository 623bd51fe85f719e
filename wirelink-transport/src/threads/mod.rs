//! Background work: the composite task runner and the transport disposal task.

pub mod close_transports_task;
pub mod composite_task_runner;

pub use close_transports_task::CloseTransportsTask;
pub use composite_task_runner::{CompositeTask, CompositeTaskRunner};
