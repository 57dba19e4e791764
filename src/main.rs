use std::sync::Arc;

use taskbeat::batch::BatchScheduler;
use taskbeat::clock::durable::spawn_durable_driver;
use taskbeat::clock::{DurableClock, DurableDispatch};
use taskbeat::config::{BatchConfig, StoreConfig, TaskConfig};
use taskbeat::error::{Result, StoreError};
use taskbeat::store::LibsqlJobStore;
use taskbeat::store::migrations::run_migrations;
use taskbeat::task::TaskHost;
use taskbeat::work::{FnWork, WorkRegistry};

/// Seed a job row if no job with this name exists yet.
async fn ensure_job(conn: &libsql::Connection, name: &str, schedule: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs (name, schedule)
         SELECT ?1, ?2 WHERE NOT EXISTS (SELECT 1 FROM jobs WHERE name = ?1)",
        libsql::params![name, schedule],
    )
    .await
    .map_err(|e| StoreError::Query(format!("ensure_job: {e}")))?;
    Ok(())
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let task_config = TaskConfig::from_env()?;
    let batch_config = BatchConfig::from_env();
    let store_config = StoreConfig::from_env();

    eprintln!("⏱  Taskbeat v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Volatile period: {}s",
        task_config.volatile_period.as_secs()
    );
    eprintln!(
        "   Durable period: {}s (poll every {}s)",
        task_config.durable_period.as_secs(),
        task_config.durable_poll_interval.as_secs()
    );
    eprintln!(
        "   Batch poll: {}s (parallelism {})",
        batch_config.poll_interval.as_secs(),
        batch_config.parallelism
    );
    eprintln!(
        "   Quarantine: after {} failures, policy {:?}",
        task_config.failure_threshold, task_config.quarantine_policy
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path_ref = std::path::Path::new(&store_config.db_path);
    if let Some(parent) = db_path_ref.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("could not create {}: {e}", parent.display()))
            })?;
        }
    }
    let db = Arc::new(
        libsql::Builder::new_local(db_path_ref)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("{}: {e}", store_config.db_path)))?,
    );
    eprintln!("   Database: {}", store_config.db_path);

    let setup_conn = db
        .connect()
        .map_err(|e| StoreError::Open(format!("connect: {e}")))?;
    run_migrations(&setup_conn).await?;

    // Demo jobs so a fresh database has something to schedule.
    ensure_job(&setup_conn, "minutely-digest", "0 * * * * *").await?;
    ensure_job(&setup_conn, "hourly-cleanup", "0 0 * * * *").await?;

    // ── Work Registry ────────────────────────────────────────────────────
    let registry = Arc::new(WorkRegistry::new());
    registry
        .register(Arc::new(FnWork::new("heartbeat", || {
            Box::pin(async {
                tracing::info!("Heartbeat");
                Ok(())
            })
        })))
        .await;
    registry
        .register(Arc::new(FnWork::new("minutely-digest", || {
            Box::pin(async {
                tracing::info!("Digest pass");
                Ok(())
            })
        })))
        .await;
    registry
        .register(Arc::new(FnWork::new("hourly-cleanup", || {
            Box::pin(async {
                tracing::info!("Cleanup pass");
                Ok(())
            })
        })))
        .await;
    eprintln!("   Works: {} registered\n", registry.count());

    // ── Task Host + Durable Clock ────────────────────────────────────────
    let clock = Arc::new(DurableClock::new(
        db.connect()
            .map_err(|e| StoreError::Open(format!("connect: {e}")))?,
    ));
    let host = Arc::new(TaskHost::new(
        task_config.clone(),
        clock.clone(),
        registry.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let dispatch: DurableDispatch = {
        let host = host.clone();
        Arc::new(move |tick| {
            let host = host.clone();
            Box::pin(async move { host.dispatch_durable_tick(tick).await })
        })
    };
    let driver = spawn_durable_driver(
        clock.clone(),
        task_config.durable_poll_interval,
        dispatch,
        shutdown_rx.clone(),
    );

    if let Err(e) = host.start("heartbeat").await {
        tracing::warn!(error = %e, "Could not start heartbeat task");
    }

    // ── Batch Scheduler ──────────────────────────────────────────────────
    let store = Arc::new(LibsqlJobStore::new(Arc::clone(&db)));
    let scheduler = BatchScheduler::new(batch_config, store, registry.clone());
    scheduler.run(shutdown_rx).await;

    host.shutdown().await;
    if let Err(e) = driver.await {
        tracing::warn!(error = %e, "Durable driver task failed");
    }
    tracing::info!("Taskbeat stopped");

    Ok(())
}
