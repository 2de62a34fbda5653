//! Workers draining the broker confirm stream.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::hook::BusHook;
use crate::outbox::Store;
use crate::publisher::{Confirms, Publisher};
use crate::transport::Provider;

pub(crate) struct Acker<S, P> {
    pub(crate) id: usize,
    pub(crate) publisher: Arc<Publisher<S, P>>,
    pub(crate) confirms: Arc<Confirms>,
    pub(crate) hook: Arc<dyn BusHook>,
}

async fn recv(receiver: &Mutex<mpsc::Receiver<u64>>) -> Option<u64> {
    receiver.lock().await.recv().await
}

impl<S, P> Acker<S, P>
where
    S: Store,
    P: Provider,
{
    /// Resolve acks and report nacks until cancelled.
    #[tracing::instrument(skip_all, fields(acker = self.id))]
    pub(crate) async fn run(self, cancel: CancellationToken) {
        loop {
            let (sequence, acked) = tokio::select! {
                _ = cancel.cancelled() => break,
                sequence = recv(&self.confirms.ack) => (sequence, true),
                sequence = recv(&self.confirms.nack) => (sequence, false),
            };
            let Some(sequence) = sequence else {
                if !cancel.is_cancelled() {
                    tracing::error!("Confirm stream closed unexpectedly");
                }
                break;
            };

            if acked {
                if let Err(error) = self.publisher.confirm(sequence).await {
                    self.hook.on_confirm_error(sequence, &error);
                }
            } else {
                self.publisher.forget(sequence);
                self.hook.on_nack(sequence);
            }
        }
        tracing::debug!("Acker stopped");
    }
}
