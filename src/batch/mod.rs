//! Transactional batch job execution.

pub mod scheduler;

pub use scheduler::{BatchScheduler, CycleReport};
