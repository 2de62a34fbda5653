//! Workers dispatching inbound deliveries to the router.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hook::BusHook;
use crate::retry::Backoff;
use crate::router::Router;
use crate::Envelope;

/// How a delivery ended on a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Acked,
    Rejected,
    /// Shutdown interrupted the retries; the delivery is left unsettled.
    Abandoned,
}

pub(crate) struct Subscriber {
    pub(crate) id: usize,
    pub(crate) router: Arc<Router>,
    pub(crate) hook: Arc<dyn BusHook>,
    pub(crate) backoff: Backoff,
    pub(crate) retry_count: u32,
}

impl Subscriber {
    /// Consumer tag of worker `id` of `service`.
    pub(crate) fn tag(service: &str, id: usize) -> String {
        format!("{service}_subscriber_{id}")
    }

    /// Process deliveries one at a time until cancelled.
    #[tracing::instrument(skip_all, fields(subscriber = self.id))]
    pub(crate) async fn run(self, cancel: CancellationToken, mut deliveries: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = deliveries.recv() => envelope,
            };
            let Some(envelope) = envelope else {
                if !cancel.is_cancelled() {
                    tracing::error!("Delivery stream closed unexpectedly");
                }
                break;
            };
            self.process(&cancel, envelope).await;
        }
        tracing::debug!("Subscriber stopped");
    }

    /// Run the router with retries, then settle the delivery.
    pub(crate) async fn process(&self, cancel: &CancellationToken, envelope: Envelope) -> Settlement {
        let envelope = Arc::new(envelope);
        let mut last_error = None;

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(id = %envelope.id, attempt, "Abandoning delivery on shutdown");
                        return Settlement::Abandoned;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.router.handle(&envelope).await {
                Ok(()) => {
                    self.hook.on_handled(&envelope, attempt);
                    envelope.ack();
                    return Settlement::Acked;
                }
                Err(error) => {
                    self.hook.on_handler_error(&envelope, attempt, error.as_ref());
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| "no attempt was made".into());
        self.hook.on_rejected(&envelope, error.as_ref());
        envelope.reject();
        Settlement::Rejected
    }
}
