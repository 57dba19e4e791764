//! Task Unit — the stateful execution context for one named recurring task.
//!
//! A unit owns two independent clocks. The volatile clock drives the task
//! body at a fast cadence and dies with the process; the durable clock is a
//! slow store-backed resurrection signal that re-activates the unit after a
//! crash, possibly on a different node. Failures are counted per unit and a
//! streak past the threshold quarantines it.

use std::sync::{Arc, Weak};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::volatile;
use crate::clock::{DurableClock, DurableHandle, TickCallback, TickStatus, VolatileHandle};
use crate::config::{QuarantinePolicy, TaskConfig};
use crate::error::{StoreError, TaskError};
use crate::task::state::TaskState;
use crate::work::Work;

/// Point-in-time view of a unit, for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub state: TaskState,
    pub consecutive_failures: u32,
}

/// Mutable unit state, guarded by one async lock.
struct UnitInner {
    state: TaskState,
    volatile: Option<VolatileHandle>,
    durable: Option<DurableHandle>,
    consecutive_failures: u32,
    // Set when the host drops the unit from its tracked set; a retired
    // unit refuses activation.
    retired: bool,
}

/// What a durable tick should do, decided under the lock and acted on
/// outside it.
enum TickAction {
    Reactivate,
    RefreshLease,
    Hold,
}

pub struct TaskUnit {
    name: String,
    config: TaskConfig,
    clock: Arc<DurableClock>,
    work: Arc<dyn Work>,
    // Handed to volatile clock callbacks so a disposed unit cannot be kept
    // alive by its own timer.
    weak_self: Weak<TaskUnit>,
    inner: Mutex<UnitInner>,
}

impl TaskUnit {
    pub fn new(
        name: impl Into<String>,
        config: TaskConfig,
        clock: Arc<DurableClock>,
        work: Arc<dyn Work>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            config,
            clock,
            work,
            weak_self: weak.clone(),
            inner: Mutex::new(UnitInner {
                state: TaskState::Inactive,
                volatile: None,
                durable: None,
                consecutive_failures: 0,
                retired: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the unit to Active: ensure a durable entry exists, then start
    /// the volatile clock with an immediate first tick.
    ///
    /// Idempotent — activating an Active unit is a no-op. Activating a
    /// Quarantined unit clears its failure streak. On a durable store
    /// failure the unit stays Inactive; there is no partial activation.
    /// A retired unit always fails activation.
    pub async fn activate(&self) -> Result<(), TaskError> {
        let mut inner = self.inner.lock().await;

        if inner.retired {
            return Err(TaskError::Activation {
                name: self.name.clone(),
                reason: "unit has been retired by its host".to_string(),
            });
        }
        if inner.state.is_active() {
            debug!(task = %self.name, "Activate on an already active task");
            return Ok(());
        }
        if !inner.state.can_transition_to(TaskState::Activating) {
            return Err(TaskError::Activation {
                name: self.name.clone(),
                reason: format!("cannot activate from state '{}'", inner.state),
            });
        }
        if inner.state.is_quarantined() {
            info!(task = %self.name, "Leaving quarantine; failure streak cleared");
            inner.consecutive_failures = 0;
        }
        inner.state = TaskState::Activating;

        // Durable registration first; it is the only step that can fail.
        // An existing entry is kept as-is so a recovery activation does not
        // rewind a due time the claim already advanced.
        let registration = async {
            match self.clock.handle_for(&self.name).await? {
                Some(handle) => Ok::<DurableHandle, StoreError>(handle),
                None => {
                    self.clock
                        .register_or_update(&self.name, Utc::now(), self.config.durable_period)
                        .await
                }
            }
        };
        let durable = match registration.await {
            Ok(handle) => handle,
            Err(e) => {
                inner.state = TaskState::Inactive;
                return Err(TaskError::Activation {
                    name: self.name.clone(),
                    reason: format!("durable clock registration failed: {e}"),
                });
            }
        };
        inner.durable = Some(durable);

        let weak = self.weak_self.clone();
        let callback: TickCallback = Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(unit) = weak.upgrade() {
                    unit.on_volatile_tick().await;
                }
            })
        });
        inner.volatile = Some(volatile::register(
            std::time::Duration::ZERO,
            self.config.volatile_period,
            callback,
        ));

        inner.state = TaskState::Active;
        info!(
            task = %self.name,
            period_secs = self.config.volatile_period.as_secs(),
            "Task activated"
        );
        Ok(())
    }

    /// One volatile tick: run the body, account the outcome.
    ///
    /// Body errors are counted, never propagated — a failing body must not
    /// stop the clock. A failure streak at the threshold quarantines the
    /// unit and disposes its own volatile clock.
    async fn on_volatile_tick(&self) {
        {
            let inner = self.inner.lock().await;
            if !inner.state.is_active() {
                return;
            }
        }

        let result = self.work.execute().await;

        let mut inner = self.inner.lock().await;
        if !inner.state.is_active() {
            // Deactivated or quarantined while the body ran; the result is
            // stale and must not touch the counter.
            return;
        }

        match result {
            Ok(()) => {
                if inner.consecutive_failures > 0 {
                    debug!(task = %self.name, "Tick succeeded; failure streak cleared");
                }
                inner.consecutive_failures = 0;
            }
            Err(e) => {
                inner.consecutive_failures += 1;
                warn!(
                    task = %self.name,
                    failures = inner.consecutive_failures,
                    error = %e,
                    "Task body failed"
                );

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = TaskState::Quarantined;
                    let handle = inner.volatile.take();
                    let err = TaskError::QuarantineThresholdExceeded {
                        name: self.name.clone(),
                        failures: inner.consecutive_failures,
                    };
                    warn!(task = %self.name, error = %err, "Task quarantined");
                    drop(inner);
                    // dispose() aborts the timer task this callback runs on;
                    // it must be the last thing this function does.
                    if let Some(handle) = handle {
                        handle.dispose();
                    }
                }
            }
        }
    }

    /// One durable tick: the recovery and lease-renewal path.
    ///
    /// May run in a process that never held this unit's volatile clock.
    /// An Inactive unit is re-activated; an Active one refreshes its lease;
    /// a Quarantined one recovers or holds, per policy.
    pub async fn on_durable_tick(&self, status: TickStatus) {
        let action = {
            let inner = self.inner.lock().await;
            match inner.state {
                TaskState::Active => TickAction::RefreshLease,
                TaskState::Inactive => TickAction::Reactivate,
                TaskState::Quarantined => match self.config.quarantine_policy {
                    QuarantinePolicy::AutoRecover => TickAction::Reactivate,
                    QuarantinePolicy::Manual => TickAction::Hold,
                },
                // Activation in progress owns the clocks.
                TaskState::Activating => return,
            }
        };

        match action {
            TickAction::Reactivate => {
                info!(
                    task = %self.name,
                    delay_secs = status.delay().num_seconds(),
                    "Durable tick: reactivating"
                );
                if let Err(e) = self.activate().await {
                    warn!(task = %self.name, error = %e, "Durable reactivation failed");
                }
            }
            TickAction::RefreshLease => {
                let next_due = Utc::now()
                    + chrono::Duration::from_std(self.config.durable_period)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                match self
                    .clock
                    .register_or_update(&self.name, next_due, self.config.durable_period)
                    .await
                {
                    Ok(_) => debug!(task = %self.name, "Durable tick: lease refreshed"),
                    Err(e) => warn!(task = %self.name, error = %e, "Lease refresh failed"),
                }
            }
            TickAction::Hold => {
                info!(
                    task = %self.name,
                    "Durable tick: quarantined, awaiting manual reset"
                );
            }
        }
    }

    /// Stop the volatile clock and return to Inactive.
    ///
    /// The durable entry is deliberately left in place — that asymmetry is
    /// what lets a later durable tick resurrect the task. Only explicit
    /// removal unregisters it.
    pub async fn deactivate(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_active() {
            return;
        }
        inner.state = TaskState::Inactive;
        let handle = inner.volatile.take();
        drop(inner);

        if let Some(handle) = handle {
            handle.dispose();
        }
        info!(task = %self.name, "Task deactivated");
    }

    /// Permanently bar this unit from activating again.
    ///
    /// Called by the host when the unit leaves the tracked set, so a stale
    /// handle cannot revive a task the host no longer knows about.
    pub(crate) async fn retire(&self) {
        self.inner.lock().await.retired = true;
    }

    /// Retire the unit only if it is still Inactive.
    ///
    /// The check and the write happen under the unit's lock, so a queued
    /// activation cannot interleave: if one already succeeded, the unit is
    /// Active and is left alone.
    pub(crate) async fn retire_if_inactive(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != TaskState::Inactive {
            return false;
        }
        inner.retired = true;
        true
    }

    /// Remove this unit's durable entry from the store.
    ///
    /// Falls back to a store lookup when the handle was registered by a
    /// previous process.
    pub async fn unregister_durable(&self) -> Result<(), StoreError> {
        let held = { self.inner.lock().await.durable.take() };
        let handle = match held {
            Some(handle) => Some(handle),
            None => self.clock.handle_for(&self.name).await?,
        };
        if let Some(handle) = handle {
            self.clock.unregister(&self.name, handle).await?;
        }
        Ok(())
    }

    /// Manual quarantine recovery: clear the streak and re-activate.
    pub async fn reset(&self) -> Result<(), TaskError> {
        {
            let mut inner = self.inner.lock().await;
            inner.consecutive_failures = 0;
        }
        self.activate().await
    }

    pub async fn status(&self) -> TaskStatus {
        let inner = self.inner.lock().await;
        TaskStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}
