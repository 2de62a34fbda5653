//! Background rescan of unconfirmed outbox records.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::hook::BusHook;
use crate::outbox::{Outbox, Scope, Store};
use crate::publisher::Publisher;
use crate::transport::Provider;

/// Periodically claims records that stayed unconfirmed for longer than the
/// grace window and hands them back to the publisher.
pub(crate) struct Looper<S, P> {
    pub(crate) outbox: Outbox<S>,
    pub(crate) publisher: Arc<Publisher<S, P>>,
    pub(crate) hook: Arc<dyn BusHook>,
    pub(crate) limit: u64,
    pub(crate) interval: Duration,
    pub(crate) min_age: Duration,
}

impl<S, P> Looper<S, P>
where
    S: Store,
    P: Provider,
{
    /// Rescan once right away, then every interval until cancelled.
    #[tracing::instrument(skip_all, fields(table = %self.outbox.table()))]
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.rescan().await;
                }
            }
        }
        tracing::debug!("Looper stopped");
    }

    /// Claim one batch and resubmit it. Returns the batch size.
    pub(crate) async fn rescan(&self) -> usize {
        match self.outbox.take(Scope::Owned, self.limit, self.min_age).await {
            Ok(envelopes) => {
                self.hook.on_rescanned(envelopes.len());
                self.publisher.publish(&envelopes).await;
                envelopes.len()
            }
            Err(error) => {
                self.hook.on_rescan_error(&error);
                0
            }
        }
    }
}
