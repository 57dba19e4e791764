//! Recurring task execution — units, lifecycle states, and the host that
//! manages them.

pub mod host;
pub mod state;
pub mod unit;

pub use host::TaskHost;
pub use state::TaskState;
pub use unit::{TaskStatus, TaskUnit};
