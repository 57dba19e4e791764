//! Error types for taskbeat.

/// Top-level error type for the scheduler core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Work error: {0}")]
    Work(#[from] WorkError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Store and transaction errors.
///
/// `TransactionOpen` and `TransactionNotOpen` signal a transaction-discipline
/// violation: a programming bug at the call site, fatal to the call and not
/// worth retrying. The remaining variants are runtime store failures and are
/// transaction-fatal for the cycle that hits them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Transaction already open")]
    TransactionOpen,

    #[error("No open transaction")]
    TransactionNotOpen,
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {name} activation failed: {reason}")]
    Activation { name: String, reason: String },

    #[error("Task {name} quarantined after {failures} consecutive failures")]
    QuarantineThresholdExceeded { name: String, failures: u32 },

    #[error("No work registered under name {name}")]
    UnknownWork { name: String },

    #[error("Task {name} is not tracked by this host")]
    NotTracked { name: String },
}

/// Work execution errors.
///
/// Body failures are caught and counted by the caller, never propagated into
/// the clock subsystem.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("Work {name} not found")]
    NotFound { name: String },

    #[error("Work {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

/// Result type alias for the scheduler core.
pub type Result<T> = std::result::Result<T, Error>;
