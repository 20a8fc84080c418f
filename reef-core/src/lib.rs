//! Task-execution runtime for the blocking connection scheduler.

pub mod executor;

pub use executor::Executor;
