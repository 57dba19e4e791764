//! Batch Scheduler — the polling driver that executes eligible jobs.
//!
//! Each cycle runs under one transaction: fetch the eligible jobs, execute
//! the due ones with bounded parallelism, mark each completion, then commit
//! — or roll the whole cycle back on any failure, so a partial set of
//! completion markers is never visible. Job side effects are not part of
//! that transaction: a crash between execution and commit re-runs the job
//! next cycle, so job bodies must tolerate at-least-once delivery.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::StoreError;
use crate::store::{CycleOutcome, CycleRecord, JobRecord, JobStore};
use crate::work::{Work, WorkRegistry};

/// What one cycle did, for logging and the history record.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub fetched: usize,
    pub executed: usize,
    pub failed: usize,
    pub outcome: CycleOutcome,
    pub detail: Option<String>,
}

enum JobOutcome {
    Completed,
    Failed(String),
}

pub struct BatchScheduler {
    config: BatchConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<WorkRegistry>,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig, store: Arc<dyn JobStore>, registry: Arc<WorkRegistry>) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    /// Run the polling loop until the shutdown signal flips.
    ///
    /// The inter-cycle sleep is interruptible; a signal arriving mid-cycle
    /// lets the current cycle finish (or roll back) first.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            parallelism = self.config.parallelism,
            "Batch scheduler started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.run_cycle().await;

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Batch scheduler stopped");
    }

    /// One cycle plus its history record.
    ///
    /// Cycles that did nothing (committed, zero executions, zero failures)
    /// leave no history row; everything else is recorded after the
    /// transaction has closed, so a rolled-back cycle still shows up.
    async fn run_cycle(&self) {
        let started_at = Utc::now();
        let outcome = self.execute_cycle().await;
        let finished_at = Utc::now();

        let record = match outcome {
            Ok(report) => {
                if report.outcome == CycleOutcome::Committed
                    && report.executed == 0
                    && report.failed == 0
                {
                    return;
                }
                match report.outcome {
                    CycleOutcome::Committed => info!(
                        executed = report.executed,
                        fetched = report.fetched,
                        "Batch cycle committed"
                    ),
                    _ => warn!(
                        failed = report.failed,
                        detail = report.detail.as_deref().unwrap_or(""),
                        "Batch cycle rolled back"
                    ),
                }
                CycleRecord {
                    id: Uuid::new_v4(),
                    started_at,
                    finished_at,
                    jobs_fetched: report.fetched,
                    jobs_executed: report.executed,
                    jobs_failed: report.failed,
                    outcome: report.outcome,
                    detail: report.detail,
                }
            }
            Err(e) => {
                error!(error = %e, "Batch cycle aborted by store failure");
                CycleRecord {
                    id: Uuid::new_v4(),
                    started_at,
                    finished_at,
                    jobs_fetched: 0,
                    jobs_executed: 0,
                    jobs_failed: 0,
                    outcome: CycleOutcome::StoreFailed,
                    detail: Some(e.to_string()),
                }
            }
        };

        if let Err(e) = self.store.record_cycle(&record).await {
            warn!(error = %e, "Failed to record cycle history");
        }
    }

    /// Execute one transactional batch cycle.
    ///
    /// Returns `Err` only for store failures that prevented the cycle from
    /// running or closing; job failures are reported in the `CycleReport`
    /// with a `RolledBack` outcome.
    pub async fn execute_cycle(&self) -> Result<CycleReport, StoreError> {
        self.store.begin().await?;

        let jobs = match self.store.fetch_eligible_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                // Transaction-fatal: close it before reporting.
                if let Err(rb) = self.store.rollback().await {
                    warn!(error = %rb, "Rollback after failed fetch also failed");
                }
                return Err(e);
            }
        };
        let fetched = jobs.len();

        let now = Utc::now();
        let due: Vec<JobRecord> = jobs.into_iter().filter(|j| job_is_due(j, now)).collect();
        let due_total = due.len();

        if due.is_empty() {
            self.store.commit().await?;
            return Ok(CycleReport {
                fetched,
                executed: 0,
                failed: 0,
                outcome: CycleOutcome::Committed,
                detail: None,
            });
        }

        // Resolve every body up front; a job with no registered work fails
        // the cycle without spawning anything.
        let mut failures: Vec<String> = Vec::new();
        let mut resolved: Vec<(JobRecord, Arc<dyn Work>)> = Vec::new();
        for job in due {
            match self.registry.get(&job.name).await {
                Some(work) => resolved.push((job, work)),
                None => {
                    warn!(job = %job.name, "No registered work for job");
                    failures.push(format!("'{}': no registered work", job.name));
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let mut join_set = JoinSet::new();
        for (job, work) in resolved {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return JobOutcome::Failed(format!("'{}': limiter closed", job.name)),
                };

                match work.execute().await {
                    Ok(()) => match store.mark_completed(job.id, Utc::now()).await {
                        Ok(()) => JobOutcome::Completed,
                        Err(e) => {
                            JobOutcome::Failed(format!("mark_completed for '{}': {e}", job.name))
                        }
                    },
                    Err(e) => JobOutcome::Failed(format!("'{}': {e}", job.name)),
                }
            });
        }

        // Drain every job before deciding; a failure must not strand
        // in-flight executions.
        let mut executed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(JobOutcome::Completed) => executed += 1,
                Ok(JobOutcome::Failed(detail)) => failures.push(detail),
                Err(e) => failures.push(format!("job task panicked: {e}")),
            }
        }

        if failures.is_empty() {
            self.store.commit().await?;
            Ok(CycleReport {
                fetched,
                executed,
                failed: 0,
                outcome: CycleOutcome::Committed,
                detail: None,
            })
        } else {
            let detail = format!(
                "{} of {} due jobs failed; first: {}",
                failures.len(),
                due_total,
                failures[0]
            );
            self.store.rollback().await?;
            Ok(CycleReport {
                fetched,
                executed,
                failed: failures.len(),
                outcome: CycleOutcome::RolledBack,
                detail: Some(detail),
            })
        }
    }
}

/// Whether a job's schedule has a fire time at or before `now` that is
/// later than its last run.
///
/// A job that has never run is due immediately. An unparseable schedule is
/// never due — a typo must not make a job run every cycle.
fn job_is_due(job: &JobRecord, now: DateTime<Utc>) -> bool {
    let schedule = match Schedule::from_str(&job.schedule) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(job = %job.name, error = %e, "Invalid schedule expression");
            return false;
        }
    };

    match job.last_run_at {
        None => true,
        Some(last) => match schedule.after(&last).next() {
            Some(fire) => fire <= now,
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn job(schedule: &str, last_run_at: Option<DateTime<Utc>>) -> JobRecord {
        JobRecord {
            id: 1,
            name: "test".to_string(),
            schedule: schedule.to_string(),
            last_run_at,
            active: true,
        }
    }

    #[test]
    fn never_run_job_is_due() {
        let now = Utc::now();
        assert!(job_is_due(&job("0 0 4 * * *", None), now));
    }

    #[test]
    fn job_is_not_due_before_next_fire() {
        // Daily at 04:00, last ran just after today's fire.
        let last = Utc.with_ymd_and_hms(2026, 1, 15, 4, 0, 5).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        assert!(!job_is_due(&job("0 0 4 * * *", Some(last)), now));
    }

    #[test]
    fn job_is_due_after_next_fire_passes() {
        let last = Utc.with_ymd_and_hms(2026, 1, 15, 4, 0, 5).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 16, 5, 0, 0).unwrap();
        assert!(job_is_due(&job("0 0 4 * * *", Some(last)), now));
    }

    #[test]
    fn every_second_schedule_is_due_again_quickly() {
        let last = Utc::now() - chrono::Duration::hours(1);
        assert!(job_is_due(&job("* * * * * *", Some(last)), Utc::now()));
    }

    #[test]
    fn invalid_schedule_is_never_due() {
        let now = Utc::now();
        assert!(!job_is_due(&job("not a schedule", None), now));
        assert!(!job_is_due(
            &job("not a schedule", Some(now - chrono::Duration::days(1))),
            now
        ));
    }
}
