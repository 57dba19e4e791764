//! Store-backed periodic trigger.
//!
//! Registrations live in the `durable_timers` table, one row per task name,
//! and survive process and node restarts. A polling driver claims due rows
//! and dispatches them; claiming advances `due_at` with a compare-and-set,
//! so multiple nodes polling one store each dispatch a disjoint set of
//! ticks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::parse_datetime;

/// Opaque identity of one durable registration.
///
/// Persisted with the row; unregistration requires presenting it back, so a
/// stale handle cannot delete a newer registration under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableHandle(Uuid);

impl DurableHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for DurableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery metadata attached to a durable tick.
#[derive(Debug, Clone)]
pub struct TickStatus {
    /// When the entry was due.
    pub due_at: DateTime<Utc>,
    /// When this process claimed it.
    pub fired_at: DateTime<Utc>,
    /// The entry's registered period.
    pub period: Duration,
}

impl TickStatus {
    /// How late the delivery was relative to the due time.
    pub fn delay(&self) -> chrono::Duration {
        self.fired_at - self.due_at
    }
}

/// A claimed durable tick, ready to dispatch.
#[derive(Debug, Clone)]
pub struct DurableTick {
    pub name: String,
    pub handle: DurableHandle,
    pub status: TickStatus,
}

/// The durable clock store.
///
/// Owns its own connection; all `durable_timers` access goes through it.
/// Expects migrations to have run on the database already.
pub struct DurableClock {
    conn: Connection,
}

impl DurableClock {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Register a durable entry for `name`, or update the existing one.
    ///
    /// Re-registration moves the due time and period but preserves the
    /// stored handle: there is never more than one entry per name.
    pub async fn register_or_update(
        &self,
        name: &str,
        due_at: DateTime<Utc>,
        period: Duration,
    ) -> Result<DurableHandle, StoreError> {
        let fresh = DurableHandle::new();
        self.conn
            .execute(
                "INSERT INTO durable_timers (task_name, handle, due_at, period_secs)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (task_name) DO UPDATE SET
                     due_at = excluded.due_at,
                     period_secs = excluded.period_secs,
                     updated_at = datetime('now')",
                params![
                    name,
                    fresh.to_string(),
                    due_at.to_rfc3339(),
                    period.as_secs() as i64
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("register_or_update: {e}")))?;

        // The fresh handle only sticks for a brand-new row; read back the
        // authoritative one.
        match self.handle_for(name).await? {
            Some(handle) => Ok(handle),
            None => Err(StoreError::Query(format!(
                "durable entry for {name} missing after upsert"
            ))),
        }
    }

    /// Look up the current handle for `name`, if one is registered.
    pub async fn handle_for(&self, name: &str) -> Result<Option<DurableHandle>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT handle FROM durable_timers WHERE task_name = ?1",
                params![name],
            )
            .await
            .map_err(|e| StoreError::Query(format!("handle_for: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("handle_for: {e}")))?;

        match row {
            Some(row) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("handle_for: {e}")))?;
                let id = Uuid::parse_str(&raw).map_err(|e| {
                    StoreError::Query(format!("handle_for: invalid handle '{raw}': {e}"))
                })?;
                Ok(Some(DurableHandle(id)))
            }
            None => Ok(None),
        }
    }

    /// Remove the entry for `name` if the handle matches.
    ///
    /// Unregistering a name with no entry (or with a stale handle) is a
    /// no-op, not an error.
    pub async fn unregister(&self, name: &str, handle: DurableHandle) -> Result<(), StoreError> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM durable_timers WHERE task_name = ?1 AND handle = ?2",
                params![name, handle.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("unregister: {e}")))?;

        if affected == 0 {
            debug!(name = %name, "No durable entry to unregister");
        }
        Ok(())
    }

    /// Claim every due entry and return the ticks to dispatch.
    ///
    /// Each claim advances `due_at` to `now + period` guarded by the old due
    /// time; a row that was claimed by another poller in between is skipped.
    pub async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<DurableTick>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT task_name, handle, due_at, period_secs
                 FROM durable_timers WHERE due_at <= ?1",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim_due: {e}")))?;

        let mut candidates = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("claim_due: {e}")))?
        {
            let name: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("claim_due: {e}")))?;
            let handle_raw: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("claim_due: {e}")))?;
            let due_raw: String = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("claim_due: {e}")))?;
            let period_secs: i64 = row
                .get(3)
                .map_err(|e| StoreError::Query(format!("claim_due: {e}")))?;
            candidates.push((name, handle_raw, due_raw, period_secs));
        }

        let mut ticks = Vec::new();
        for (name, handle_raw, due_raw, period_secs) in candidates {
            let period = Duration::from_secs(period_secs.max(0) as u64);
            let next_due = now
                + chrono::Duration::from_std(period)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));

            let affected = self
                .conn
                .execute(
                    "UPDATE durable_timers
                     SET due_at = ?1, updated_at = datetime('now')
                     WHERE task_name = ?2 AND due_at = ?3",
                    params![next_due.to_rfc3339(), name.as_str(), due_raw.as_str()],
                )
                .await
                .map_err(|e| StoreError::Query(format!("claim_due: {e}")))?;

            if affected == 0 {
                debug!(name = %name, "Durable entry already claimed elsewhere");
                continue;
            }

            let handle = match Uuid::parse_str(&handle_raw) {
                Ok(id) => DurableHandle(id),
                Err(e) => {
                    warn!(name = %name, "Invalid durable handle in store: {}", e);
                    continue;
                }
            };

            ticks.push(DurableTick {
                name,
                handle,
                status: TickStatus {
                    due_at: parse_datetime(&due_raw),
                    fired_at: now,
                    period,
                },
            });
        }

        Ok(ticks)
    }
}

/// Callback that routes a claimed tick to its task.
pub type DurableDispatch =
    Arc<dyn Fn(DurableTick) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Spawn the durable polling driver.
///
/// Claims due entries every `poll_interval` and hands each to `dispatch`.
/// Store errors are logged and retried on the next poll; they never stop
/// the driver.
pub fn spawn_durable_driver(
    clock: Arc<DurableClock>,
    poll_interval: Duration,
    dispatch: DurableDispatch,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Durable clock driver started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match clock.claim_due(Utc::now()).await {
                Ok(ticks) => {
                    for tick in ticks {
                        dispatch(tick).await;
                    }
                }
                Err(e) => {
                    error!("Durable poll failed: {}", e);
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!("Durable clock driver stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrations::run_migrations;

    async fn test_clock() -> DurableClock {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        let conn = db.connect().unwrap();
        run_migrations(&conn).await.unwrap();
        DurableClock::new(conn)
    }

    async fn entry_count(clock: &DurableClock) -> i64 {
        let mut rows = clock
            .conn
            .query("SELECT COUNT(*) FROM durable_timers", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn register_twice_updates_not_duplicates() {
        let clock = test_clock().await;
        let now = Utc::now();

        let h1 = clock
            .register_or_update("reports", now, Duration::from_secs(60))
            .await
            .unwrap();
        let h2 = clock
            .register_or_update(
                "reports",
                now + chrono::Duration::hours(1),
                Duration::from_secs(120),
            )
            .await
            .unwrap();

        assert_eq!(h1, h2, "re-registration must preserve the handle");
        assert_eq!(entry_count(&clock).await, 1);
    }

    #[tokio::test]
    async fn unregister_absent_is_noop() {
        let clock = test_clock().await;
        let stray = DurableHandle::new();
        clock.unregister("ghost", stray).await.unwrap();
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let clock = test_clock().await;
        let handle = clock
            .register_or_update("reports", Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();

        clock.unregister("reports", handle).await.unwrap();
        assert!(clock.handle_for("reports").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unregister_with_stale_handle_keeps_entry() {
        let clock = test_clock().await;
        let current = clock
            .register_or_update("reports", Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();

        clock.unregister("reports", DurableHandle::new()).await.unwrap();
        assert_eq!(clock.handle_for("reports").await.unwrap(), Some(current));
    }

    #[tokio::test]
    async fn claim_due_advances_due_time() {
        let clock = test_clock().await;
        let now = Utc::now();
        clock
            .register_or_update(
                "reports",
                now - chrono::Duration::seconds(5),
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        let ticks = clock.claim_due(now).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].name, "reports");
        assert_eq!(ticks[0].status.period, Duration::from_secs(600));
        assert!(ticks[0].status.delay() >= chrono::Duration::zero());

        // The same instant claims nothing further.
        assert!(clock.claim_due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_due_ignores_future_entries() {
        let clock = test_clock().await;
        let now = Utc::now();
        clock
            .register_or_update(
                "reports",
                now + chrono::Duration::hours(1),
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        assert!(clock.claim_due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn driver_dispatches_and_stops() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let clock = Arc::new(test_clock().await);
        clock
            .register_or_update(
                "reports",
                Utc::now() - chrono::Duration::seconds(1),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_dispatch = fired.clone();
        let dispatch: DurableDispatch = Arc::new(move |tick| {
            let fired = fired_in_dispatch.clone();
            Box::pin(async move {
                assert_eq!(tick.name, "reports");
                fired.fetch_add(1, Ordering::SeqCst);
            })
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = spawn_durable_driver(
            clock,
            Duration::from_millis(50),
            dispatch,
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        driver.await.unwrap();
    }
}
