//! Job Store Gateway — eligible-job reads and completion-marker writes,
//! scoped to the caller's transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::parse_datetime;
use crate::store::uow::UnitOfWork;

/// One scheduled job as stored.
///
/// Owned by the job table; read-only to the core except `last_run_at`.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub name: String,
    pub schedule: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// How a batch cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Committed,
    RolledBack,
    StoreFailed,
}

/// Convert a CycleOutcome to its DB string.
fn outcome_to_str(outcome: CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Committed => "committed",
        CycleOutcome::RolledBack => "rolled_back",
        CycleOutcome::StoreFailed => "store_failed",
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", outcome_to_str(*self))
    }
}

/// Post-cycle history row, written after the transaction has closed.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs_fetched: usize,
    pub jobs_executed: usize,
    pub jobs_failed: usize,
    pub outcome: CycleOutcome,
    pub detail: Option<String>,
}

/// Transactional gateway over the job table.
///
/// `fetch_eligible_jobs` and `mark_completed` run against whatever
/// transaction is open on the underlying Unit of Work (if any), so a batch
/// cycle's read and its writes stay consistent.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Open the cycle transaction.
    async fn begin(&self) -> Result<(), StoreError>;

    /// Commit the cycle transaction.
    async fn commit(&self) -> Result<(), StoreError>;

    /// Roll back the cycle transaction.
    async fn rollback(&self) -> Result<(), StoreError>;

    /// All jobs with `active = true`, in no particular order.
    async fn fetch_eligible_jobs(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Set a job's last-run marker.
    async fn mark_completed(
        &self,
        job_id: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record a finished cycle. Called after commit or rollback, never
    /// inside the transaction, so history survives a rolled-back cycle.
    async fn record_cycle(&self, record: &CycleRecord) -> Result<(), StoreError>;
}

/// libSQL-backed job store over one shared Unit of Work.
///
/// Store access is serialized behind an async mutex: concurrent job
/// executions in one cycle funnel their completion markers through a
/// single connection.
pub struct LibsqlJobStore {
    uow: Mutex<UnitOfWork>,
}

impl LibsqlJobStore {
    pub fn new(db: Arc<libsql::Database>) -> Self {
        Self {
            uow: Mutex::new(UnitOfWork::new(db)),
        }
    }
}

/// Map a jobs row to a JobRecord.
///
/// Column order: 0:id, 1:name, 2:schedule, 3:last_run_at, 4:active
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, StoreError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("jobs row: {e}")))?;
    let name: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("jobs row: {e}")))?;
    let schedule: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("jobs row: {e}")))?;
    let last_run_raw: Option<String> = row.get::<String>(3).ok();
    let active: i64 = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("jobs row: {e}")))?;

    Ok(JobRecord {
        id,
        name,
        schedule,
        last_run_at: last_run_raw.map(|s| parse_datetime(&s)),
        active: active != 0,
    })
}

#[async_trait]
impl JobStore for LibsqlJobStore {
    async fn begin(&self) -> Result<(), StoreError> {
        self.uow.lock().await.begin().await
    }

    async fn commit(&self) -> Result<(), StoreError> {
        self.uow.lock().await.commit().await
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        self.uow.lock().await.rollback().await
    }

    async fn fetch_eligible_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut uow = self.uow.lock().await;
        let conn = uow.connection()?;

        let mut rows = conn
            .query(
                "SELECT id, name, schedule, last_run_at, active FROM jobs WHERE active = 1",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("fetch_eligible_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("fetch_eligible_jobs: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn mark_completed(
        &self,
        job_id: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut uow = self.uow.lock().await;
        let conn = uow.connection()?;

        let affected = conn
            .execute(
                "UPDATE jobs SET last_run_at = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![completed_at.to_rfc3339(), job_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_completed: {e}")))?;

        if affected == 0 {
            return Err(StoreError::Query(format!(
                "mark_completed: job {job_id} not found"
            )));
        }
        Ok(())
    }

    async fn record_cycle(&self, record: &CycleRecord) -> Result<(), StoreError> {
        let mut uow = self.uow.lock().await;
        debug_assert!(!uow.in_transaction(), "cycle history is written outside the transaction");
        let conn = uow.connection()?;

        conn.execute(
            "INSERT INTO batch_cycles
                 (id, started_at, finished_at, jobs_fetched, jobs_executed, jobs_failed, outcome, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.to_string(),
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
                record.jobs_fetched as i64,
                record.jobs_executed as i64,
                record.jobs_failed as i64,
                outcome_to_str(record.outcome),
                record.detail.as_deref(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("record_cycle: {e}")))?;
        Ok(())
    }
}
