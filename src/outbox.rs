//! Transactional outbox.
//!
//! The outbox is the durable half of the bus. A message that requires a
//! broker confirm is first *staged* as a row in a per-service table, ideally
//! inside the same transaction as the business writes that produced it. The
//! row stays until the broker confirms the publish, at which point the
//! acker calls [`Outbox::done`]. Anything that was staged but never
//! confirmed (process crash, dropped confirm, broker nack) is picked up
//! again by [`Outbox::take`] from the rescan loop.
//!
//! ## Components
//!
//! - [`Outbox`]: stage / done / take / migrate over a [`Store`]
//! - [`Store`]: the transactional storage collaborator
//! - [`Scope`]: run inside a caller transaction or in an owned one
//!
//! Concrete stores live in [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "postgres")]
pub mod sqlx;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::envelope::{Envelope, RECORD_ID};

/// Error returned by outbox operations.
///
/// Wraps the underlying store or codec error and captures a tracing span
/// backtrace for improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Outbox error kinds.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// Errors originating from the store.
    Store(tower::BoxError),
    /// The envelope could not be encoded or decoded.
    Codec(bitcode::Error),
}

impl OutboxError {
    pub(crate) fn store(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Store(err),
        }
    }

    fn codec(err: bitcode::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Codec(err),
        }
    }

    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
            OutboxErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Store(err) => Some(err.as_ref()),
            OutboxErrorKind::Codec(err) => Some(err),
        }
    }
}

/// Status of an outbox row. Deletion is the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum RecordStatus {
    /// Waiting for the broker confirm.
    Pending = 0,
}

/// A row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub message: Vec<u8>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

/// A row claimed for resubmission.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedRecord {
    pub id: i64,
    pub message: Vec<u8>,
}

/// Transactional storage used by the outbox.
///
/// Implementations must make every write performed through a transaction
/// visible only after [`Store::commit`], and discard it on
/// [`Store::rollback`].
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Transaction handle.
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, tower::BoxError>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), tower::BoxError>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), tower::BoxError>;

    /// Create the outbox table if it does not exist yet.
    async fn create_table(&self, table: &str) -> Result<(), tower::BoxError>;

    /// Delete every row of the table, returning how many were removed.
    async fn purge(&self, table: &str) -> Result<u64, tower::BoxError>;

    /// Insert a row and return its generated id.
    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        record: NewRecord,
    ) -> Result<i64, tower::BoxError>;

    /// Delete a row. Deleting a missing row is not an error.
    async fn delete(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        id: i64,
    ) -> Result<(), tower::BoxError>;

    /// Lock up to `limit` pending rows last sent no later than `sent_before`,
    /// oldest id first, stamp their last send time with `now` and return
    /// them.
    async fn claim(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        limit: u64,
        sent_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedRecord>, tower::BoxError>;
}

/// Where an outbox operation runs.
pub enum Scope<'a, T> {
    /// Begin, and commit or roll back, a transaction owned by the operation.
    Owned,
    /// Run inside a caller transaction; the caller decides its fate.
    Within(&'a mut T),
}

/// Outbox of a single service, backed by a [`Store`].
pub struct Outbox<S> {
    store: Arc<S>,
    table: String,
}

impl<S> Clone for Outbox<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            table: self.table.clone(),
        }
    }
}

impl<S> Outbox<S>
where
    S: Store,
{
    /// Create the outbox of `service`. The table name is derived from it.
    pub fn new(store: Arc<S>, service: &str) -> Self {
        Self {
            store,
            table: format!("courier_{service}_outbox"),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Ensure the backing table exists. Safe to call on every start.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn migrate(&self) -> Result<(), OutboxError> {
        self.store
            .create_table(&self.table)
            .await
            .map_err(OutboxError::store)
    }

    /// Delete every record.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn purge(&self) -> Result<u64, OutboxError> {
        let purged = self
            .store
            .purge(&self.table)
            .await
            .map_err(OutboxError::store)?;
        tracing::info!(purged, "Outbox purged");
        Ok(purged)
    }

    /// Persist an envelope as a pending record.
    ///
    /// On success the record id is written into the envelope header under
    /// [`RECORD_ID`]. When staged [`Scope::Within`] a caller transaction, the
    /// record only becomes visible if that transaction commits.
    #[instrument(skip_all, fields(table = %self.table, id = %envelope.id))]
    pub async fn stage(
        &self,
        scope: Scope<'_, S::Transaction>,
        envelope: &mut Envelope,
    ) -> Result<i64, OutboxError> {
        match scope {
            Scope::Within(tx) => self.stage_in(tx, envelope).await,
            Scope::Owned => {
                let mut tx = self.begin().await?;
                let result = self.stage_in(&mut tx, envelope).await;
                self.finish(tx, result).await
            }
        }
    }

    /// Delete a record once its publish is confirmed. Idempotent.
    #[instrument(skip(self, scope), fields(table = %self.table))]
    pub async fn done(&self, scope: Scope<'_, S::Transaction>, id: i64) -> Result<(), OutboxError> {
        match scope {
            Scope::Within(tx) => self.done_in(tx, id).await,
            Scope::Owned => {
                let mut tx = self.begin().await?;
                let result = self.done_in(&mut tx, id).await;
                self.finish(tx, result).await
            }
        }
    }

    /// Claim up to `limit` records not sent for at least `min_age`.
    ///
    /// Records come back oldest first with their record id in the header,
    /// and their last send time is bumped so a concurrent rescan does not
    /// pick them up again right away. Records that cannot be decoded are
    /// logged and skipped.
    #[instrument(skip(self, scope), fields(table = %self.table))]
    pub async fn take(
        &self,
        scope: Scope<'_, S::Transaction>,
        limit: u64,
        min_age: Duration,
    ) -> Result<Vec<Envelope>, OutboxError> {
        match scope {
            Scope::Within(tx) => self.take_in(tx, limit, min_age).await,
            Scope::Owned => {
                let mut tx = self.begin().await?;
                let result = self.take_in(&mut tx, limit, min_age).await;
                self.finish(tx, result).await
            }
        }
    }

    async fn stage_in(
        &self,
        tx: &mut S::Transaction,
        envelope: &mut Envelope,
    ) -> Result<i64, OutboxError> {
        let record = NewRecord {
            message: envelope.encode().map_err(OutboxError::codec)?,
            status: RecordStatus::Pending,
            created_at: Utc::now(),
        };
        let id = self
            .store
            .insert(tx, &self.table, record)
            .await
            .map_err(OutboxError::store)?;
        envelope.header.set(RECORD_ID, id);
        tracing::debug!(record_id = id, "Envelope staged");
        Ok(id)
    }

    async fn done_in(&self, tx: &mut S::Transaction, id: i64) -> Result<(), OutboxError> {
        self.store
            .delete(tx, &self.table, id)
            .await
            .map_err(OutboxError::store)
    }

    async fn take_in(
        &self,
        tx: &mut S::Transaction,
        limit: u64,
        min_age: Duration,
    ) -> Result<Vec<Envelope>, OutboxError> {
        let now = Utc::now();
        let sent_before = chrono::Duration::from_std(min_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let records = self
            .store
            .claim(tx, &self.table, limit, sent_before, now)
            .await
            .map_err(OutboxError::store)?;

        let mut envelopes = Vec::with_capacity(records.len());
        for record in records {
            match Envelope::decode(&record.message) {
                Ok(mut envelope) => {
                    envelope.header.set(RECORD_ID, record.id);
                    envelopes.push(envelope);
                }
                Err(error) => {
                    tracing::error!(record_id = record.id, %error, "Skipping undecodable outbox record");
                }
            }
        }
        Ok(envelopes)
    }

    async fn begin(&self) -> Result<S::Transaction, OutboxError> {
        self.store.begin().await.map_err(OutboxError::store)
    }

    async fn finish<T>(
        &self,
        tx: S::Transaction,
        result: Result<T, OutboxError>,
    ) -> Result<T, OutboxError> {
        match result {
            Ok(value) => {
                self.store.commit(tx).await.map_err(OutboxError::store)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(error) = self.store.rollback(tx).await {
                    tracing::error!(%error, "Outbox transaction rollback failed");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::inmemory::InMemoryStore;
    use super::*;
    use crate::envelope::Policy;

    async fn outbox() -> (InMemoryStore, Outbox<InMemoryStore>) {
        let store = InMemoryStore::default();
        let outbox = Outbox::new(Arc::new(store.clone()), "svc");
        outbox.migrate().await.unwrap();
        (store, outbox)
    }

    fn envelope(n: u8) -> Envelope {
        Envelope::new("topic", "handler", vec![n], Policy::default())
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let (store, outbox) = outbox().await;
        outbox.stage(Scope::Owned, &mut envelope(1)).await.unwrap();
        outbox.migrate().await.unwrap();
        assert_eq!(store.count(outbox.table()), 1);
    }

    #[tokio::test]
    async fn stage_writes_record_id_into_header() {
        let (store, outbox) = outbox().await;
        let mut env = envelope(1);

        let id = outbox.stage(Scope::Owned, &mut env).await.unwrap();

        assert_eq!(env.record_id(), Some(id));
        assert_eq!(store.count(outbox.table()), 1);
    }

    #[tokio::test]
    async fn stage_without_table_fails() {
        let store = InMemoryStore::default();
        let outbox = Outbox::new(Arc::new(store), "svc");
        assert!(outbox.stage(Scope::Owned, &mut envelope(1)).await.is_err());
    }

    #[tokio::test]
    async fn rolled_back_stage_leaves_no_record() {
        let (store, outbox) = outbox().await;
        let mut tx = store.begin().await.unwrap();
        tx.insert("orders", b"order-1".to_vec());
        outbox
            .stage(Scope::Within(&mut tx), &mut envelope(1))
            .await
            .unwrap();

        store.rollback(tx).await.unwrap();

        assert_eq!(store.count(outbox.table()), 0);
        assert_eq!(store.count("orders"), 0);
    }

    #[tokio::test]
    async fn committed_stage_is_visible() {
        let (store, outbox) = outbox().await;
        let mut tx = store.begin().await.unwrap();
        tx.insert("orders", b"order-1".to_vec());
        outbox
            .stage(Scope::Within(&mut tx), &mut envelope(1))
            .await
            .unwrap();
        assert_eq!(store.count(outbox.table()), 0);

        store.commit(tx).await.unwrap();

        assert_eq!(store.count(outbox.table()), 1);
        assert_eq!(store.count("orders"), 1);
    }

    #[tokio::test]
    async fn done_is_idempotent() {
        let (store, outbox) = outbox().await;
        let id = outbox.stage(Scope::Owned, &mut envelope(1)).await.unwrap();

        outbox.done(Scope::Owned, id).await.unwrap();
        outbox.done(Scope::Owned, id).await.unwrap();

        assert_eq!(store.count(outbox.table()), 0);
    }

    #[tokio::test]
    async fn take_returns_oldest_first_up_to_limit() {
        let (_store, outbox) = outbox().await;
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(outbox.stage(Scope::Owned, &mut envelope(n)).await.unwrap());
        }

        let taken = outbox.take(Scope::Owned, 2, Duration::ZERO).await.unwrap();

        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].record_id(), Some(ids[0]));
        assert_eq!(taken[0].payload, vec![0]);
        assert_eq!(taken[1].record_id(), Some(ids[1]));
    }

    #[tokio::test]
    async fn take_skips_recently_sent_records() {
        let (_store, outbox) = outbox().await;
        outbox.stage(Scope::Owned, &mut envelope(1)).await.unwrap();

        let fresh = outbox
            .take(Scope::Owned, 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(fresh.is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let taken = outbox
            .take(Scope::Owned, 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        // the claim stamped the last send time
        let again = outbox
            .take(Scope::Owned, 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn take_on_empty_outbox_is_empty() {
        let (_store, outbox) = outbox().await;
        let taken = outbox.take(Scope::Owned, 10, Duration::ZERO).await.unwrap();
        assert!(taken.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_everything() {
        let (store, outbox) = outbox().await;
        outbox.stage(Scope::Owned, &mut envelope(1)).await.unwrap();
        outbox.stage(Scope::Owned, &mut envelope(2)).await.unwrap();

        assert_eq!(outbox.purge().await.unwrap(), 2);
        assert_eq!(store.count(outbox.table()), 0);
    }
}
