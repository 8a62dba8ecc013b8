//! Database Connection Management and Concurrency Control
//!
//! `DatabaseService` exclusively owns the live libsql database: every other
//! component reaches the engine through [`DatabaseService::read`],
//! [`DatabaseService::write`], or [`DatabaseService::write_transaction`], and
//! never holds a connection of its own.
//!
//! # Concurrency model
//!
//! Many concurrent readers XOR one exclusive writer, arbitrated by a
//! `tokio::sync::RwLock`. The lock queues acquisitions fairly
//! (write-preferring): once a write request is pending, no read requested
//! after it is granted until the write has executed, so sustained read load
//! can never starve a writer. In-flight reads always drain before the writer
//! proceeds - no operation is interrupted mid-flight.
//!
//! Slot guards are RAII: a panic inside a held slot still releases it on
//! unwind. Acquisition never times out by itself; callers wanting a deadline
//! wrap the call in their own timeout, and a request abandoned before its
//! slot is granted leaves no side effects.
//!
//! # Connections
//!
//! Each operation gets a fresh connection with a busy timeout; WAL mode
//! lets those reader connections proceed in parallel against the single
//! on-disk file.

use crate::db::error::DatabaseError;
use libsql::{Builder, Connection, Database};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Database service owning the libsql handle and the reader/writer lock.
///
/// Cloning is cheap and shares the same database and lock, so one engine
/// instance can be used from many tasks. Multiple independent instances in
/// one process (e.g. in tests) never share state.
#[derive(Debug, Clone)]
pub struct DatabaseService {
    db: Arc<Database>,
    /// Reader/writer arbitration; the () payload carries no data, the lock
    /// discipline is the point
    slots: Arc<RwLock<()>>,
    /// Path to the database file
    pub db_path: PathBuf,
}

impl DatabaseService {
    /// Open (or create) the database file.
    ///
    /// Ensures the parent directory exists, opens the file, and configures
    /// WAL mode plus a busy timeout. Schema creation is a separate step
    /// ([`crate::db::schema::apply`]) because it needs the ontology.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DatabaseError::permission_denied(db_path.clone())
                    } else {
                        DatabaseError::DirectoryCreationFailed(e)
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;

        let service = Self {
            db: Arc::new(db),
            slots: Arc::new(RwLock::new(())),
            db_path,
        };

        // Connection-independent pragmas, issued once up front
        let conn = service.connect().await?;
        service.execute_pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        Ok(service)
    }

    /// Open a fresh connection with the busy timeout applied.
    ///
    /// Private: components must go through `read`/`write`/`write_transaction`
    /// so the slot discipline cannot be bypassed.
    async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self.db.connect()?;
        self.execute_pragma(&conn, "PRAGMA busy_timeout = 5000").await?;
        Ok(conn)
    }

    /// Execute a PRAGMA statement.
    ///
    /// PRAGMA statements return rows, so query() is required over execute().
    async fn execute_pragma(&self, conn: &Connection, pragma: &str) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    /// Run a read operation in a shared slot.
    ///
    /// Multiple reads run concurrently; a read requested after a write
    /// became pending waits until that write has executed.
    pub async fn read<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        E: From<DatabaseError>,
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _slot = self.slots.read().await;
        let conn = self.connect().await.map_err(E::from)?;
        op(conn).await
    }

    /// Run a write operation in the exclusive slot.
    ///
    /// Blocks until all in-flight reads finish and no other writer holds the
    /// slot. No transaction is opened; use [`Self::write_transaction`] for
    /// multi-statement atomicity.
    pub async fn write<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        E: From<DatabaseError>,
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _slot = self.slots.write().await;
        let conn = self.connect().await.map_err(E::from)?;
        op(conn).await
    }

    /// Run a write operation inside one database transaction.
    ///
    /// Commits when `op` returns Ok; rolls back and re-raises the error
    /// otherwise. Effects are invisible to concurrent readers until commit.
    ///
    /// Provider calls (embedding/lexical) must be resolved to concrete
    /// values *before* entering here - the transaction body should contain
    /// no suspension points on external I/O, or the exclusive slot is held
    /// across network latency.
    pub async fn write_transaction<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        E: From<DatabaseError>,
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _slot = self.slots.write().await;
        let conn = self.connect().await.map_err(E::from)?;

        conn.execute("BEGIN IMMEDIATE", ()).await.map_err(|e| {
            E::from(DatabaseError::transaction_failed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        match op(conn.clone()).await {
            Ok(value) => match conn.execute("COMMIT", ()).await {
                Ok(_) => Ok(value),
                Err(e) => {
                    // Commit failed; leave the connection clean, best effort
                    if let Err(rollback_err) = conn.execute("ROLLBACK", ()).await {
                        tracing::error!(
                            "Rollback after failed commit also failed: {}",
                            rollback_err
                        );
                    }
                    Err(E::from(DatabaseError::transaction_failed(format!(
                        "Failed to commit transaction: {}",
                        e
                    ))))
                }
            },
            Err(err) => {
                if let Err(rollback_err) = conn.execute("ROLLBACK", ()).await {
                    tracing::error!("Rollback after failed transaction also failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }
}
