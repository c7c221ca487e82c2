//! In-memory transactional data source.
//!
//! Rows are JSON values keyed by `(table, id)`. A connection with an open
//! transaction reads from a private working copy and keeps a write log; the
//! log is applied to the shared tables on commit and thrown away on rollback.
//! Without a transaction every write is applied immediately.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};
use txgate_core::{ResourceProvider, TransactionDefinition, TransactionManager};

type Table = BTreeMap<String, Value>;
type Tables = BTreeMap<String, Table>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Write {
    Put { table: String, id: String, row: Value },
    Delete { table: String, id: String },
    Clear { table: String },
}

impl Write {
    fn apply(&self, tables: &mut Tables) {
        match self {
            Write::Put { table, id, row } => {
                tables
                    .entry(table.clone())
                    .or_default()
                    .insert(id.clone(), row.clone());
            }
            Write::Delete { table, id } => {
                if let Some(rows) = tables.get_mut(table) {
                    rows.remove(id);
                }
            }
            Write::Clear { table } => {
                tables.remove(table);
            }
        }
    }
}

struct OpenTransaction {
    read_only: bool,
    working: Tables,
    log: Vec<Write>,
}

/// Counters kept by a [`MemoryDataSource`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataSourceStats {
    pub acquired: usize,
    pub released: usize,
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
}

impl DataSourceStats {
    /// Connections acquired but not yet released.
    pub fn outstanding(&self) -> usize {
        self.acquired.saturating_sub(self.released)
    }
}

#[derive(Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

/// Shared in-memory store acting as both resource provider and transaction
/// manager.
#[derive(Default)]
pub struct MemoryDataSource {
    tables: Arc<Mutex<Tables>>,
    counters: Counters,
    next_connection: AtomicU64,
    fail_acquire: AtomicBool,
    fail_commit: AtomicBool,
    fail_release: AtomicBool,
    definitions: Mutex<Vec<TransactionDefinition>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `acquire` fail.
    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Make every following `commit` fail.
    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Make every following `release` fail (the connection is still dropped).
    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DataSourceStats {
        DataSourceStats {
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            begun: self.counters.begun.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            rolled_back: self.counters.rolled_back.load(Ordering::SeqCst),
        }
    }

    /// Definitions passed to `begin`, in order.
    pub fn definitions(&self) -> Vec<TransactionDefinition> {
        lock(&self.definitions).clone()
    }

    /// Committed rows of `table`, ordered by id.
    pub fn committed_rows(&self, table: &str) -> Vec<Value> {
        lock(&self.tables)
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A connection outside the acquire/release bookkeeping, for seeding and
    /// inspecting data in tests.
    pub fn direct(&self) -> MemoryConnection {
        self.connect()
    }

    fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            id: self.next_connection.fetch_add(1, Ordering::SeqCst),
            tables: Arc::clone(&self.tables),
            open: Arc::new(Mutex::new(None)),
        }
    }
}

/// Handle to one logical connection. Clones share the same open transaction.
#[derive(Clone)]
pub struct MemoryConnection {
    id: u64,
    tables: Arc<Mutex<Tables>>,
    open: Arc<Mutex<Option<OpenTransaction>>>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        lock(&self.open).is_some()
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Value> {
        self.read(|tables| tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    /// Every row of `table`, ordered by id.
    pub fn all(&self, table: &str) -> Vec<Value> {
        self.read(|tables| {
            tables
                .get(table)
                .map(|rows| rows.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Insert or replace a row.
    pub fn put(&self, table: &str, id: &str, row: Value) -> Result<()> {
        self.write(Write::Put {
            table: table.to_string(),
            id: id.to_string(),
            row,
        })
    }

    /// Insert a row, failing if the id is taken.
    pub fn insert(&self, table: &str, id: &str, row: Value) -> Result<()> {
        if self.get(table, id).is_some() {
            bail!("duplicate key {id:?} in {table}");
        }
        self.put(table, id, row)
    }

    pub fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let existed = self.get(table, id).is_some();
        self.write(Write::Delete {
            table: table.to_string(),
            id: id.to_string(),
        })?;
        Ok(existed)
    }

    /// Remove every row of `table`, returning how many there were.
    pub fn clear(&self, table: &str) -> Result<usize> {
        let count = self.all(table).len();
        self.write(Write::Clear {
            table: table.to_string(),
        })?;
        Ok(count)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let open = lock(&self.open);
        match open.as_ref() {
            Some(tx) => f(&tx.working),
            None => f(&lock(&self.tables)),
        }
    }

    fn write(&self, write: Write) -> Result<()> {
        let mut open = lock(&self.open);
        match open.as_mut() {
            Some(tx) if tx.read_only => {
                bail!("connection {} is in a read-only transaction", self.id)
            }
            Some(tx) => {
                write.apply(&mut tx.working);
                tx.log.push(write);
            }
            None => write.apply(&mut lock(&self.tables)),
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

#[async_trait]
impl ResourceProvider for MemoryDataSource {
    type Resource = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(anyhow!("connection pool exhausted"));
        }
        let connection = self.connect();
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(connection = connection.id, "connection acquired");
        Ok(connection)
    }

    async fn release(&self, connection: MemoryConnection) -> Result<()> {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        if lock(&connection.open).take().is_some() {
            warn!(connection = connection.id, "released with an open transaction, discarded");
        }
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(anyhow!("connection {} could not be returned", connection.id));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionManager for MemoryDataSource {
    async fn begin(
        &self,
        connection: &MemoryConnection,
        definition: &TransactionDefinition,
    ) -> Result<()> {
        let mut open = lock(&connection.open);
        if open.is_some() {
            bail!("connection {} already has an open transaction", connection.id);
        }
        *open = Some(OpenTransaction {
            read_only: definition.read_only,
            working: lock(&self.tables).clone(),
            log: Vec::new(),
        });
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        lock(&self.definitions).push(definition.clone());
        Ok(())
    }

    async fn commit(&self, connection: &MemoryConnection) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(anyhow!("commit rejected by store"));
        }
        let tx = lock(&connection.open)
            .take()
            .ok_or_else(|| anyhow!("connection {} has no open transaction", connection.id))?;

        let mut tables = lock(&self.tables);
        for write in &tx.log {
            write.apply(&mut tables);
        }
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, connection: &MemoryConnection) -> Result<()> {
        let discarded = lock(&connection.open).take().map(|tx| tx.log.len());
        self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        debug!(connection = connection.id, ?discarded, "connection rolled back");
        Ok(())
    }
}
