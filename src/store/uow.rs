//! Unit of Work — one connection, at most one open transaction.
//!
//! The connection opens lazily on first use and is released only when the
//! Unit of Work itself is dropped. Transactions are the per-cycle resource:
//! begun, then committed or rolled back, while the connection lives on
//! across cycles. An open transaction at drop rolls back with the
//! connection.

use std::sync::Arc;

use libsql::{Connection, Database};

use crate::error::StoreError;

/// Transaction boundary around one lazily opened connection.
pub struct UnitOfWork {
    db: Arc<Database>,
    conn: Option<Connection>,
    tx_open: bool,
}

impl UnitOfWork {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            conn: None,
            tx_open: false,
        }
    }

    /// The underlying connection, opened on first use.
    pub fn connection(&mut self) -> Result<&Connection, StoreError> {
        match self.conn {
            Some(ref conn) => Ok(conn),
            None => {
                let conn = self
                    .db
                    .connect()
                    .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;
                Ok(self.conn.insert(conn))
            }
        }
    }

    /// True while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx_open
    }

    /// Begin a transaction. Fails if one is already open.
    pub async fn begin(&mut self) -> Result<(), StoreError> {
        if self.tx_open {
            return Err(StoreError::TransactionOpen);
        }

        let conn = self.connection()?;
        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| StoreError::Query(format!("begin: {e}")))?;

        self.tx_open = true;
        Ok(())
    }

    /// Commit the open transaction. Fails if none is open.
    ///
    /// The open flag is cleared before the statement runs, so the Unit of
    /// Work is back in a closed state even when COMMIT itself fails.
    pub async fn commit(&mut self) -> Result<(), StoreError> {
        if !self.tx_open {
            return Err(StoreError::TransactionNotOpen);
        }
        self.tx_open = false;

        let conn = self.connection()?;
        if let Err(e) = conn.execute("COMMIT", ()).await {
            // A failed COMMIT can leave the transaction open on the
            // connection side; roll it back so the connection stays usable.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(StoreError::Query(format!("commit: {e}")));
        }
        Ok(())
    }

    /// Roll back the open transaction. Fails if none is open.
    ///
    /// Same state contract as [`UnitOfWork::commit`].
    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.tx_open {
            return Err(StoreError::TransactionNotOpen);
        }
        self.tx_open = false;

        let conn = self.connection()?;
        conn.execute("ROLLBACK", ())
            .await
            .map_err(|e| StoreError::Query(format!("rollback: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_uow() -> UnitOfWork {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        UnitOfWork::new(Arc::new(db))
    }

    #[tokio::test]
    async fn begin_twice_is_an_error() {
        let mut uow = test_uow().await;
        uow.begin().await.unwrap();
        assert!(matches!(
            uow.begin().await.unwrap_err(),
            StoreError::TransactionOpen
        ));
    }

    #[tokio::test]
    async fn commit_without_begin_is_an_error() {
        let mut uow = test_uow().await;
        assert!(matches!(
            uow.commit().await.unwrap_err(),
            StoreError::TransactionNotOpen
        ));
    }

    #[tokio::test]
    async fn rollback_without_begin_is_an_error() {
        let mut uow = test_uow().await;
        assert!(matches!(
            uow.rollback().await.unwrap_err(),
            StoreError::TransactionNotOpen
        ));
    }

    #[tokio::test]
    async fn transaction_cycle_reuses_connection() {
        let mut uow = test_uow().await;
        uow.connection()
            .unwrap()
            .execute("CREATE TABLE t (v INTEGER)", ())
            .await
            .unwrap();

        for i in 0..3 {
            uow.begin().await.unwrap();
            assert!(uow.in_transaction());
            uow.connection()
                .unwrap()
                .execute("INSERT INTO t (v) VALUES (?1)", libsql::params![i])
                .await
                .unwrap();
            uow.commit().await.unwrap();
            assert!(!uow.in_transaction());
        }

        let mut rows = uow
            .connection()
            .unwrap()
            .query("SELECT COUNT(*) FROM t", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let mut uow = test_uow().await;
        uow.connection()
            .unwrap()
            .execute("CREATE TABLE t (v INTEGER)", ())
            .await
            .unwrap();

        uow.begin().await.unwrap();
        uow.connection()
            .unwrap()
            .execute("INSERT INTO t (v) VALUES (1)", ())
            .await
            .unwrap();
        uow.rollback().await.unwrap();

        let mut rows = uow
            .connection()
            .unwrap()
            .query("SELECT COUNT(*) FROM t", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn begin_works_again_after_rollback() {
        let mut uow = test_uow().await;
        uow.begin().await.unwrap();
        uow.rollback().await.unwrap();
        uow.begin().await.unwrap();
        uow.commit().await.unwrap();
    }
}
