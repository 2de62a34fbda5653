//! Broker submission and confirm bookkeeping.
//!
//! Every confirm-tracked publish gets the next broker sequence number. The
//! publisher remembers which outbox record each pending sequence number
//! belongs to, so the acker can delete the record once the broker
//! acknowledges it.
//!
//! A record has at most one pending sequence number. When a confirm never
//! arrives the rescan republishes the record, and the new sequence number
//! replaces the old one, so the table is bounded by the outbox itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::hook::BusHook;
use crate::outbox::{Outbox, OutboxError, Scope, Store};
use crate::transport::{Provider, TransportError};
use crate::Envelope;

/// Receiving half of the broker confirm stream, shared by the ackers.
pub(crate) struct Confirms {
    pub(crate) ack: tokio::sync::Mutex<mpsc::Receiver<u64>>,
    pub(crate) nack: tokio::sync::Mutex<mpsc::Receiver<u64>>,
}

pub(crate) struct Publisher<S, P> {
    outbox: Outbox<S>,
    provider: Arc<P>,
    hook: Arc<dyn BusHook>,
    // Held across the submission of a confirm-tracked envelope so sequence
    // numbers follow submission order.
    sequence: tokio::sync::Mutex<u64>,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    records: HashMap<u64, Option<i64>>,
    sequences: HashMap<i64, u64>,
}

impl Pending {
    fn insert(&mut self, sequence: u64, record_id: Option<i64>) {
        if let Some(id) = record_id {
            if let Some(stale) = self.sequences.insert(id, sequence) {
                self.records.remove(&stale);
                tracing::debug!(record_id = id, stale, sequence, "Superseding unconfirmed publish");
            }
        }
        self.records.insert(sequence, record_id);
    }

    fn remove(&mut self, sequence: u64) -> Option<Option<i64>> {
        let record_id = self.records.remove(&sequence)?;
        if let Some(id) = record_id {
            if self.sequences.get(&id) == Some(&sequence) {
                self.sequences.remove(&id);
            }
        }
        Some(record_id)
    }
}

impl<S, P> Publisher<S, P>
where
    S: Store,
    P: Provider,
{
    pub(crate) fn new(outbox: Outbox<S>, provider: Arc<P>, hook: Arc<dyn BusHook>) -> Self {
        Self {
            outbox,
            provider,
            hook,
            sequence: tokio::sync::Mutex::new(0),
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Register confirm channels with the provider and hand back their
    /// receiving half.
    pub(crate) fn start(&self, buffer: usize) -> Confirms {
        let (ack_tx, ack_rx) = mpsc::channel(buffer);
        let (nack_tx, nack_rx) = mpsc::channel(buffer);
        self.provider.notify_confirm(ack_tx, nack_tx);
        Confirms {
            ack: tokio::sync::Mutex::new(ack_rx),
            nack: tokio::sync::Mutex::new(nack_rx),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of confirm-tracked publishes still waiting for the broker.
    pub(crate) fn in_flight(&self) -> usize {
        self.pending().records.len()
    }

    /// Submit a batch in order. A failed submission is reported through the
    /// hook and does not stop the batch; its outbox record stays for rescan.
    pub(crate) async fn publish(&self, envelopes: &[Envelope]) {
        for envelope in envelopes {
            match self.publish_one(envelope).await {
                Ok(()) => self.hook.on_published(envelope),
                Err(error) => self.hook.on_publish_error(envelope, &error),
            }
        }
    }

    async fn publish_one(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !envelope.policy.confirm {
            return self.provider.publish(envelope).await;
        }

        let mut sequence = self.sequence.lock().await;
        let next = *sequence + 1;
        self.pending().insert(next, envelope.record_id());
        match self.provider.publish(envelope).await {
            Ok(()) => {
                *sequence = next;
                Ok(())
            }
            Err(error) => {
                self.pending().remove(next);
                Err(error)
            }
        }
    }

    /// Resolve an acknowledged sequence number and delete its outbox record.
    ///
    /// Unknown sequence numbers are ignored. When the delete fails the
    /// record stays in the outbox and is republished by the rescan.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn confirm(&self, sequence: u64) -> Result<(), OutboxError> {
        let Some(record_id) = self.pending().remove(sequence) else {
            tracing::debug!("Ignoring confirm for unknown sequence number");
            return Ok(());
        };
        if let Some(id) = record_id {
            self.outbox.done(Scope::Owned, id).await?;
        }
        self.hook.on_confirmed(sequence, record_id);
        Ok(())
    }

    /// Drop the bookkeeping of a refused sequence number. The outbox record
    /// is left for rescan.
    pub(crate) fn forget(&self, sequence: u64) {
        self.pending().remove(sequence);
    }
}
