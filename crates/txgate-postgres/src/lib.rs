//! PostgreSQL transaction manager for txgate.
//!
//! This crate provides a [`TransactionManager`] over an `sqlx` connection
//! pool. Each intercepted call gets a [`PgSession`]; the session holds the
//! open `sqlx` transaction and routes queries through it, so data accessors
//! that take the call's context transparently join the transaction.
//!
//! # Features
//!
//! - Isolation level and read-only applied with `SET TRANSACTION`
//! - Sessions without a transaction fall back to the pool (autocommit)
//! - Leftover transactions are rolled back on release
//!
//! # Usage
//!
//! ```rust,ignore
//! use txgate_postgres::PgTransactionManager;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let manager = Arc::new(PgTransactionManager::new(pool));
//!
//! let gate = TxGateBuilder::new(manager.clone())
//!     .with_sink(mail_sink)
//!     .build()?;
//!
//! // In a data accessor:
//! let scope = ResourceScope::new(manager);
//! scope
//!     .run_in(ctx, |session| async move {
//!         session
//!             .execute(sqlx::query("UPDATE users SET level = $1 WHERE id = $2").bind(level).bind(id))
//!             .await
//!     })
//!     .await?;
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use txgate_core::{ResourceProvider, TransactionDefinition, TransactionManager};

/// A query with bound arguments, ready to run on a session.
pub type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// PostgreSQL transaction manager.
#[derive(Clone)]
pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    /// Create a transaction manager over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connections currently held by the pool.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

/// One unit of work against the database.
///
/// Clones share the same transaction slot.
#[derive(Clone)]
pub struct PgSession {
    pool: PgPool,
    tx: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl PgSession {
    fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tx: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn in_transaction(&self) -> bool {
        self.tx.lock().await.is_some()
    }

    /// Run a statement, returning the number of affected rows.
    pub async fn execute(&self, query: PgQuery<'_>) -> Result<u64> {
        let mut tx = self.tx.lock().await;
        let result = match tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    pub async fn fetch_all(&self, query: PgQuery<'_>) -> Result<Vec<PgRow>> {
        let mut tx = self.tx.lock().await;
        let rows = match tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    pub async fn fetch_optional(&self, query: PgQuery<'_>) -> Result<Option<PgRow>> {
        let mut tx = self.tx.lock().await;
        let row = match tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(row)
    }
}

/// `SET TRANSACTION` statement for a definition, or `None` when the server
/// defaults already apply.
pub fn set_transaction_sql(definition: &TransactionDefinition) -> Option<String> {
    let mut modes = Vec::new();
    if let Some(level) = definition.isolation.as_sql() {
        modes.push(format!("ISOLATION LEVEL {level}"));
    }
    if definition.read_only {
        modes.push("READ ONLY".to_string());
    }
    (!modes.is_empty()).then(|| format!("SET TRANSACTION {}", modes.join(", ")))
}

#[async_trait]
impl ResourceProvider for PgTransactionManager {
    type Resource = PgSession;

    async fn acquire(&self) -> Result<PgSession> {
        if self.pool.is_closed() {
            bail!("connection pool is closed");
        }
        Ok(PgSession::new(self.pool.clone()))
    }

    /// Roll back anything the session still holds.
    async fn release(&self, session: PgSession) -> Result<()> {
        if let Some(tx) = session.tx.lock().await.take() {
            warn!("session released with an open transaction, rolling back");
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    async fn begin(&self, session: &PgSession, definition: &TransactionDefinition) -> Result<()> {
        let mut slot = session.tx.lock().await;
        if slot.is_some() {
            bail!("session already has an open transaction");
        }

        let mut tx = self.pool.begin().await?;
        if let Some(sql) = set_transaction_sql(definition) {
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        debug!(name = %definition.name, "postgres transaction started");

        *slot = Some(tx);
        Ok(())
    }

    async fn commit(&self, session: &PgSession) -> Result<()> {
        let tx = session
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("no open transaction to commit"))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, session: &PgSession) -> Result<()> {
        if let Some(tx) = session.tx.lock().await.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
