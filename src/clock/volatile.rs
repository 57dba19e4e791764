//! In-memory periodic trigger.
//!
//! Backed by a spawned tokio timer task. Nothing is persisted: every
//! registration is gone on process exit, which is exactly why the durable
//! clock exists.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Boxed callback invoked on every tick.
pub type TickCallback = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Owned handle to a registered volatile clock.
///
/// The timer task stops when the handle is disposed or dropped.
pub struct VolatileHandle {
    task: JoinHandle<()>,
}

impl VolatileHandle {
    /// Cancel the clock. The timer task stops at its next await point.
    pub fn dispose(self) {
        self.task.abort();
    }
}

impl Drop for VolatileHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Register a periodic callback.
///
/// The first tick fires after `due`, then every `period`. The callback is
/// awaited on the timer task, so one slow invocation delays the next tick
/// rather than overlapping with it.
pub fn register(due: Duration, period: Duration, callback: TickCallback) -> VolatileHandle {
    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + due, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            callback().await;
        }
    });

    VolatileHandle { task }
}
