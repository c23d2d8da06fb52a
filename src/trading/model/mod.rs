pub mod execution;
pub mod task;
