use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::outbox::{ClaimedRecord, NewRecord, RecordStatus, Store};

/// An in-memory transactional store for testing or local usage.
///
/// Writes made through an [`InMemoryTransaction`] are buffered and applied
/// atomically on commit; a rollback (or dropping the transaction) discards
/// them. Rows claimed by an open transaction are locked and skipped by
/// concurrent claims until that transaction ends.
///
/// Besides outbox tables, transactions can write arbitrary rows with
/// [`InMemoryTransaction::insert`], which stands in for the business writes
/// an application performs next to its outbox.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    tables: HashMap<String, Table>,
    locked: HashSet<(String, i64)>,
    unavailable: bool,
}

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Row>,
}

impl Table {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A committed row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub message: Vec<u8>,
    pub status: i16,
    pub create_at: DateTime<Utc>,
    pub last_send_at: DateTime<Utc>,
}

enum Op {
    Insert { table: String, id: i64, row: Row },
    Delete { table: String, id: i64 },
    Touch { table: String, ids: Vec<i64>, at: DateTime<Utc> },
}

impl InMemoryStore {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    /// Committed rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<(i64, Row)> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|(id, row)| (*id, row.clone())).collect())
            .unwrap_or_default()
    }

    /// Number of committed rows in a table.
    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Make every new transaction fail to begin, simulating a database outage.
    pub fn fail_transactions(&self, fail: bool) {
        self.lock().unavailable = fail;
    }
}

/// Transaction over an [`InMemoryStore`].
pub struct InMemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    ops: Vec<Op>,
    locks: Vec<(String, i64)>,
}

impl InMemoryTransaction {
    /// Insert an arbitrary row, creating the table if needed.
    pub fn insert(&mut self, table: &str, data: impl Into<Vec<u8>>) -> i64 {
        let now = Utc::now();
        let row = Row {
            message: data.into(),
            status: 0,
            create_at: now,
            last_send_at: now,
        };
        let id = lock(&self.tables)
            .tables
            .entry(table.to_owned())
            .or_default()
            .allocate_id();
        self.ops.push(Op::Insert {
            table: table.to_owned(),
            id,
            row,
        });
        id
    }

    fn apply(&mut self) {
        let mut tables = lock(&self.tables);
        for op in self.ops.drain(..) {
            match op {
                Op::Insert { table, id, row } => {
                    tables.tables.entry(table).or_default().rows.insert(id, row);
                }
                Op::Delete { table, id } => {
                    if let Some(t) = tables.tables.get_mut(&table) {
                        t.rows.remove(&id);
                    }
                }
                Op::Touch { table, ids, at } => {
                    if let Some(t) = tables.tables.get_mut(&table) {
                        for id in ids {
                            if let Some(row) = t.rows.get_mut(&id) {
                                row.last_send_at = at;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.locks.is_empty() {
            return;
        }
        let mut tables = lock(&self.tables);
        for key in self.locks.drain(..) {
            tables.locked.remove(&key);
        }
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error type for `InMemoryStore` operations.
#[derive(Debug)]
pub struct InMemoryStoreError {
    kind: InMemoryStoreErrorKind,
}

impl InMemoryStoreError {
    fn unavailable() -> Self {
        Self {
            kind: InMemoryStoreErrorKind::Unavailable,
        }
    }

    fn missing_table(table: &str) -> Self {
        Self {
            kind: InMemoryStoreErrorKind::MissingTable(table.to_owned()),
        }
    }
}

impl std::fmt::Display for InMemoryStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryStoreErrorKind::MissingTable(table) => {
                write!(f, "Table {table} does not exist in in-memory store")
            }
            InMemoryStoreErrorKind::Unavailable => write!(f, "In-memory store is unavailable"),
        }
    }
}

impl std::error::Error for InMemoryStoreError {}

#[derive(Debug)]
enum InMemoryStoreErrorKind {
    MissingTable(String),
    Unavailable,
}

#[async_trait]
impl Store for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, tower::BoxError> {
        if self.lock().unavailable {
            return Err(InMemoryStoreError::unavailable().into());
        }
        Ok(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            ops: Vec::new(),
            locks: Vec::new(),
        })
    }

    async fn commit(&self, mut tx: Self::Transaction) -> Result<(), tower::BoxError> {
        tx.apply();
        Ok(())
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), tower::BoxError> {
        drop(tx);
        Ok(())
    }

    async fn create_table(&self, table: &str) -> Result<(), tower::BoxError> {
        self.lock().tables.entry(table.to_owned()).or_default();
        Ok(())
    }

    async fn purge(&self, table: &str) -> Result<u64, tower::BoxError> {
        let mut tables = self.lock();
        let t = tables
            .tables
            .get_mut(table)
            .ok_or_else(|| InMemoryStoreError::missing_table(table))?;
        let purged = t.rows.len() as u64;
        t.rows.clear();
        Ok(purged)
    }

    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        record: NewRecord,
    ) -> Result<i64, tower::BoxError> {
        let id = self
            .lock()
            .tables
            .get_mut(table)
            .ok_or_else(|| InMemoryStoreError::missing_table(table))?
            .allocate_id();
        tx.ops.push(Op::Insert {
            table: table.to_owned(),
            id,
            row: Row {
                message: record.message,
                status: record.status as i16,
                create_at: record.created_at,
                last_send_at: record.created_at,
            },
        });
        Ok(id)
    }

    async fn delete(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        id: i64,
    ) -> Result<(), tower::BoxError> {
        if !self.lock().tables.contains_key(table) {
            return Err(InMemoryStoreError::missing_table(table).into());
        }
        tx.ops.push(Op::Delete {
            table: table.to_owned(),
            id,
        });
        Ok(())
    }

    async fn claim(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        limit: u64,
        sent_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedRecord>, tower::BoxError> {
        let mut tables = self.lock();
        let Tables { tables, locked, .. } = &mut *tables;
        let t = tables
            .get(table)
            .ok_or_else(|| InMemoryStoreError::missing_table(table))?;

        let claimed: Vec<ClaimedRecord> = t
            .rows
            .iter()
            .filter(|(id, row)| {
                row.status == RecordStatus::Pending as i16
                    && row.last_send_at <= sent_before
                    && !locked.contains(&(table.to_owned(), **id))
            })
            .take(limit as usize)
            .map(|(id, row)| ClaimedRecord {
                id: *id,
                message: row.message.clone(),
            })
            .collect();

        for record in &claimed {
            let key = (table.to_owned(), record.id);
            locked.insert(key.clone());
            tx.locks.push(key);
        }
        if !claimed.is_empty() {
            tx.ops.push(Op::Touch {
                table: table.to_owned(),
                ids: claimed.iter().map(|r| r.id).collect(),
                at: now,
            });
        }
        Ok(claimed)
    }
}
