//! Dual-clock scheduling primitives.
//!
//! Two independently owned periodic triggers sit behind the same
//! scheduled-callback shape:
//! - `volatile` — in-memory tokio timer, fast cadence, lost on process exit
//! - `durable` — store-backed timer rows, slow cadence, survives restarts
//!   and can fire from any node
//!
//! The volatile clock does the real work; the durable clock exists purely
//! as a resurrection signal.

pub mod durable;
pub mod volatile;

pub use durable::{DurableClock, DurableDispatch, DurableHandle, DurableTick, TickStatus};
pub use volatile::{TickCallback, VolatileHandle};
