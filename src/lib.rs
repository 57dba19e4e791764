//! Taskbeat — durable recurring-task execution core with a transactional
//! batch scheduler.

pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod task;
pub mod work;
