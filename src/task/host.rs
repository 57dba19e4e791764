//! Task Host — the single authority for which tasks are active.
//!
//! Tracks at most one unit per task name, guarantees one effective
//! activation under concurrent callers, and rebuilds units when a durable
//! tick arrives for a task this process has never seen.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::clock::{DurableClock, DurableTick};
use crate::config::TaskConfig;
use crate::error::{StoreError, TaskError};
use crate::task::unit::{TaskStatus, TaskUnit};
use crate::work::WorkRegistry;

pub struct TaskHost {
    config: TaskConfig,
    clock: Arc<DurableClock>,
    registry: Arc<WorkRegistry>,
    units: DashMap<String, Arc<TaskUnit>>,
}

impl TaskHost {
    pub fn new(config: TaskConfig, clock: Arc<DurableClock>, registry: Arc<WorkRegistry>) -> Self {
        Self {
            config,
            clock,
            registry,
            units: DashMap::new(),
        }
    }

    /// Return the tracked unit for `name`, creating and activating it first
    /// if necessary.
    ///
    /// Safe under concurrent calls for the same name: the map entry is
    /// created exactly once and activation is idempotent, so every caller
    /// gets the same unit and the clocks are registered once. A failed
    /// activation evicts the unit so a retry starts fresh — unless a
    /// concurrent activation of the same unit succeeded, in which case it
    /// stays tracked.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<TaskUnit>, TaskError> {
        // Resolve the work before touching the map; the entry guard must
        // not be held across an await.
        let work = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| TaskError::UnknownWork {
                name: name.to_string(),
            })?;

        let unit = self
            .units
            .entry(name.to_string())
            .or_insert_with(|| TaskUnit::new(name, self.config.clone(), self.clock.clone(), work))
            .clone();

        match unit.activate().await {
            Ok(()) => Ok(unit),
            Err(e) => {
                self.discard_failed(name, &unit).await;
                Err(e)
            }
        }
    }

    /// Cleanup after a failed activation: retire the unit and evict it from
    /// the tracked set — unless a concurrent activation of the same unit
    /// won, which leaves it Active and tracked.
    ///
    /// The retire decision runs under the unit's lock, so it cannot race a
    /// queued activation, and a retired unit refuses activation, so the
    /// evicted Arc can never come back to life untracked.
    async fn discard_failed(&self, name: &str, unit: &Arc<TaskUnit>) {
        if unit.retire_if_inactive().await {
            self.units
                .remove_if(name, |_, tracked| Arc::ptr_eq(tracked, unit));
        }
    }

    /// Permanently stop a task: deactivate it and delete its durable entry.
    ///
    /// This is the only path that unregisters the durable clock; ordinary
    /// deactivation leaves it so the task can be resurrected. Works for
    /// names this process never activated — the entry may have been written
    /// by a previous incarnation. The removed unit is retired: a stale
    /// handle to it can no longer re-activate it.
    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        match self.units.remove(name) {
            Some((_, unit)) => {
                unit.retire().await;
                unit.deactivate().await;
                unit.unregister_durable().await?;
                info!(task = %name, "Task removed");
            }
            None => {
                if let Some(handle) = self.clock.handle_for(name).await? {
                    self.clock.unregister(name, handle).await?;
                    info!(task = %name, "Removed durable entry for untracked task");
                } else {
                    debug!(task = %name, "Remove: nothing tracked under this name");
                }
            }
        }
        Ok(())
    }

    /// Deactivate every tracked unit. Durable entries are left in place.
    pub async fn shutdown(&self) {
        let units: Vec<Arc<TaskUnit>> = self.units.iter().map(|e| e.value().clone()).collect();
        info!(count = units.len(), "Task host shutting down");
        for unit in units {
            unit.deactivate().await;
        }
    }

    /// Route a claimed durable tick to its unit.
    ///
    /// A tick for an untracked name is the crash-recovery path: the unit is
    /// rebuilt from the registry and the tick re-activates it. A tick for a
    /// name with no registered work is logged and dropped; the durable
    /// entry stays for a process that does know the work.
    pub async fn dispatch_durable_tick(&self, tick: DurableTick) {
        if let Some(unit) = self.units.get(&tick.name).map(|e| e.value().clone()) {
            unit.on_durable_tick(tick.status).await;
            return;
        }

        let Some(work) = self.registry.get(&tick.name).await else {
            warn!(
                task = %tick.name,
                "Durable tick for unknown work; leaving entry for a later owner"
            );
            return;
        };

        let unit = self
            .units
            .entry(tick.name.clone())
            .or_insert_with(|| {
                TaskUnit::new(tick.name.clone(), self.config.clone(), self.clock.clone(), work)
            })
            .clone();
        unit.on_durable_tick(tick.status).await;
    }

    /// Manually recover a quarantined task.
    pub async fn reset(&self, name: &str) -> Result<(), TaskError> {
        let unit = self
            .units
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| TaskError::NotTracked {
                name: name.to_string(),
            })?;
        unit.reset().await
    }

    /// Snapshot of every tracked unit.
    pub async fn statuses(&self) -> Vec<TaskStatus> {
        let units: Vec<Arc<TaskUnit>> = self.units.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(units.len());
        for unit in units {
            out.push(unit.status().await);
        }
        out
    }

    /// Control-surface alias for [`Self::get_or_create`].
    pub async fn start(&self, name: &str) -> Result<Arc<TaskUnit>, TaskError> {
        self.get_or_create(name).await
    }

    /// Control-surface alias for [`Self::remove`].
    pub async fn stop(&self, name: &str) -> Result<(), StoreError> {
        self.remove(name).await
    }
}
