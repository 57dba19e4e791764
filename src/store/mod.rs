//! Persistence layer — libSQL-backed job store, durable timers, and
//! cycle history.

use chrono::{DateTime, Utc};

pub mod jobs;
pub mod migrations;
pub mod uow;

pub use jobs::{CycleOutcome, CycleRecord, JobRecord, JobStore, LibsqlJobStore};
pub use uow::UnitOfWork;

/// Parse a stored timestamp, tolerating both our RFC 3339 writes and
/// SQLite's `datetime('now')` output.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339() {
        let dt = parse_datetime("2026-01-15T04:30:00+00:00");
        assert_eq!(dt.to_rfc3339(), "2026-01-15T04:30:00+00:00");
    }

    #[test]
    fn parses_sqlite_datetime() {
        let dt = parse_datetime("2026-01-15 04:30:00");
        assert_eq!(dt.to_rfc3339(), "2026-01-15T04:30:00+00:00");
    }

    #[test]
    fn garbage_falls_back_to_min() {
        assert_eq!(parse_datetime("not a date"), DateTime::<Utc>::MIN_UTC);
    }
}
