use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, Outcome};
use crate::transport::{Provider, TransportError};

/// How the in-memory broker answers confirm-tracked publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Route the message and ack it.
    #[default]
    Ack,
    /// Refuse the message and nack it.
    Nack,
    /// Route the message but never confirm it.
    Drop,
}

/// In-process broker for testing or local pipelines.
///
/// The broker keeps one queue per service and topic bindings from topic to
/// service queues, mirroring a topic exchange per topic. Messages travel in
/// encoded form, so a delivered envelope is a fresh copy of the published
/// one. Rejected deliveries are dead-lettered; deliveries abandoned without
/// an outcome are requeued at the front.
///
/// Each bus connects with its own [`InMemoryProvider`] obtained from
/// [`InMemoryBroker::connect`]; several providers sharing one broker model
/// several services talking through the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Arc<Queue>>,
    bindings: HashMap<String, HashSet<String>>,
    confirm_mode: ConfirmMode,
    fail_publishes: bool,
    published: usize,
}

#[derive(Default)]
struct Queue {
    messages: Mutex<VecDeque<Vec<u8>>>,
    dead_letters: Mutex<Vec<Vec<u8>>>,
    acked: AtomicUsize,
    notify: Notify,
}

impl Queue {
    fn push(&self, message: Vec<u8>) {
        lock(&self.messages).push_back(message);
        self.notify.notify_one();
    }

    fn requeue(&self, message: Vec<u8>) {
        lock(&self.messages).push_front(message);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = lock(&self.messages).pop_front() {
                return message;
            }
            notified.await;
        }
    }

    fn purge(&self) {
        lock(&self.messages).clear();
        lock(&self.dead_letters).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBroker {
    /// Open a new provider session on this broker.
    pub fn connect(&self) -> InMemoryProvider {
        InMemoryProvider {
            broker: self.clone(),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        lock(&self.state).confirm_mode = mode;
    }

    /// Make every publish fail until switched off again.
    pub fn fail_publishes(&self, fail: bool) {
        lock(&self.state).fail_publishes = fail;
    }

    /// Number of successful publishes so far.
    pub fn published(&self) -> usize {
        lock(&self.state).published
    }

    /// Messages waiting in the queue of `service`.
    pub fn queued(&self, service: &str) -> usize {
        self.queue(service).map_or(0, |q| lock(&q.messages).len())
    }

    /// Deliveries of `service` that were acknowledged.
    pub fn acked(&self, service: &str) -> usize {
        self.queue(service)
            .map_or(0, |q| q.acked.load(Ordering::SeqCst))
    }

    /// Rejected deliveries of `service`.
    pub fn dead_letters(&self, service: &str) -> Vec<Envelope> {
        self.queue(service)
            .map(|q| {
                lock(&q.dead_letters)
                    .iter()
                    .filter_map(|bytes| Envelope::decode(bytes).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn queue(&self, service: &str) -> Option<Arc<Queue>> {
        lock(&self.state).queues.get(service).cloned()
    }
}

#[derive(Default)]
struct Session {
    service: Option<String>,
    confirms: Option<(mpsc::Sender<u64>, mpsc::Sender<u64>)>,
    sequence: u64,
    closed: CancellationToken,
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryProvider {
    broker: InMemoryBroker,
    session: Mutex<Session>,
}

impl InMemoryProvider {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    #[tracing::instrument(skip(self, topics))]
    async fn init(
        &self,
        service: &str,
        purge: bool,
        topics: &[String],
    ) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.broker.state);
            let queue = Arc::clone(state.queues.entry(service.to_owned()).or_default());
            if purge {
                queue.purge();
            }
            for topic in topics {
                state
                    .bindings
                    .entry(topic.clone())
                    .or_default()
                    .insert(service.to_owned());
            }
        }

        let mut session = self.session();
        session.service = Some(service.to_owned());
        session.sequence = 0;
        session.closed = CancellationToken::new();
        tracing::info!(?topics, "In-memory provider initialized");
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.session().service.is_none() {
            return Err(TransportError::closed());
        }
        let message = envelope.encode().map_err(TransportError::codec)?;

        let mode = {
            let mut state = lock(&self.broker.state);
            if state.fail_publishes {
                return Err(TransportError::broker("broker refused the publish"));
            }
            let mode = if envelope.policy.confirm {
                state.confirm_mode
            } else {
                ConfirmMode::Ack
            };
            if mode != ConfirmMode::Nack {
                let targets: Vec<Arc<Queue>> = state
                    .bindings
                    .get(&envelope.topic)
                    .into_iter()
                    .flatten()
                    .filter_map(|service| state.queues.get(service).cloned())
                    .collect();
                for queue in targets {
                    queue.push(message.clone());
                }
            }
            state.published += 1;
            mode
        };

        if !envelope.policy.confirm {
            return Ok(());
        }

        let (sequence, confirms) = {
            let mut session = self.session();
            session.sequence += 1;
            (session.sequence, session.confirms.clone())
        };
        let Some((ack, nack)) = confirms else {
            return Ok(());
        };
        let sent = match mode {
            ConfirmMode::Ack => ack.send(sequence).await.is_ok(),
            ConfirmMode::Nack => nack.send(sequence).await.is_ok(),
            ConfirmMode::Drop => true,
        };
        if !sent {
            tracing::warn!(sequence, "Confirm channel closed");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        consumer_tag: &str,
        output: mpsc::Sender<Envelope>,
    ) -> Result<(), TransportError> {
        let (service, closed) = {
            let session = self.session();
            let service = session.service.clone().ok_or_else(TransportError::closed)?;
            (service, session.closed.clone())
        };
        let queue = self.broker.queue(&service).ok_or_else(TransportError::closed)?;
        let consumer_tag = consumer_tag.to_owned();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = closed.cancelled() => break,
                    message = queue.pop() => message,
                };
                let mut envelope = match Envelope::decode(&message) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        tracing::error!(%error, consumer_tag, "Dead-lettering undecodable message");
                        lock(&queue.dead_letters).push(message);
                        continue;
                    }
                };
                let outcome = envelope.track();

                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = closed.cancelled() => false,
                    sent = output.send(envelope) => sent.is_ok(),
                };
                if !sent {
                    queue.requeue(message);
                    break;
                }

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    _ = closed.cancelled() => None,
                    outcome = outcome => outcome.ok(),
                };
                match outcome {
                    Some(Outcome::Ack) => {
                        queue.acked.fetch_add(1, Ordering::SeqCst);
                    }
                    Some(Outcome::Reject) => lock(&queue.dead_letters).push(message),
                    None => {
                        queue.requeue(message);
                        if cancel.is_cancelled() || closed.is_cancelled() {
                            break;
                        }
                        tracing::debug!(consumer_tag, "Redelivering abandoned message");
                    }
                }
            }
            tracing::debug!(consumer_tag, "In-memory consumer stopped");
        });
        Ok(())
    }

    fn notify_confirm(&self, ack: mpsc::Sender<u64>, nack: mpsc::Sender<u64>) {
        self.session().confirms = Some((ack, nack));
    }

    async fn exit(&self) -> Result<(), TransportError> {
        let mut session = self.session();
        session.closed.cancel();
        session.service = None;
        session.confirms = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::envelope::Policy;

    async fn provider(broker: &InMemoryBroker, topics: &[&str]) -> InMemoryProvider {
        let provider = broker.connect();
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        provider.init("svc", false, &topics).await.unwrap();
        provider
    }

    #[tokio::test]
    async fn confirms_carry_increasing_sequence_numbers() {
        let broker = InMemoryBroker::default();
        let provider = provider(&broker, &["orders"]).await;
        let (ack_tx, mut ack_rx) = mpsc::channel(10);
        let (nack_tx, _nack_rx) = mpsc::channel(10);
        provider.notify_confirm(ack_tx, nack_tx);

        let env = Envelope::new("orders", "created", b"1".to_vec(), Policy::default());
        provider.publish(&env).await.unwrap();
        provider.publish(&env).await.unwrap();
        let unconfirmed = Envelope::new("orders", "created", b"2".to_vec(), Policy::fire_and_forget());
        provider.publish(&unconfirmed).await.unwrap();

        assert_eq!(ack_rx.recv().await, Some(1));
        assert_eq!(ack_rx.recv().await, Some(2));
        assert!(ack_rx.try_recv().is_err());
        assert_eq!(broker.queued("svc"), 3);
    }

    #[tokio::test]
    async fn nacked_messages_are_not_routed() {
        let broker = InMemoryBroker::default();
        broker.set_confirm_mode(ConfirmMode::Nack);
        let provider = provider(&broker, &["orders"]).await;
        let (ack_tx, _ack_rx) = mpsc::channel(10);
        let (nack_tx, mut nack_rx) = mpsc::channel(10);
        provider.notify_confirm(ack_tx, nack_tx);

        let env = Envelope::new("orders", "created", b"1".to_vec(), Policy::default());
        provider.publish(&env).await.unwrap();

        assert_eq!(nack_rx.recv().await, Some(1));
        assert_eq!(broker.queued("svc"), 0);
    }

    #[tokio::test]
    async fn rejected_delivery_is_dead_lettered() {
        let broker = InMemoryBroker::default();
        let provider = provider(&broker, &["orders"]).await;
        let env = Envelope::new("orders", "created", b"1".to_vec(), Policy::default());
        provider.publish(&env).await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        provider
            .subscribe(CancellationToken::new(), "consumer", tx)
            .await
            .unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.id, env.id);
        delivered.reject();

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.dead_letters("svc").is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.dead_letters("svc")[0].id, env.id);
    }

    #[tokio::test]
    async fn abandoned_delivery_is_requeued() {
        let broker = InMemoryBroker::default();
        let provider = provider(&broker, &["orders"]).await;
        let env = Envelope::new("orders", "created", b"1".to_vec(), Policy::default());
        provider.publish(&env).await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        provider
            .subscribe(CancellationToken::new(), "consumer", tx)
            .await
            .unwrap();
        drop(rx.recv().await.unwrap());

        let redelivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.id, env.id);
        redelivered.ack();

        let next = Envelope::new("orders", "created", b"2".to_vec(), Policy::default());
        provider.publish(&next).await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.id, next.id);
    }

    #[tokio::test]
    async fn cancelled_consumer_leaves_delivery_queued() {
        let broker = InMemoryBroker::default();
        let provider = provider(&broker, &["orders"]).await;
        let env = Envelope::new("orders", "created", b"1".to_vec(), Policy::default());
        provider.publish(&env).await.unwrap();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        provider.subscribe(cancel.clone(), "consumer", tx).await.unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(broker.queued("svc"), 0);

        cancel.cancel();
        assert!(rx.recv().await.is_none());
        drop(delivered);

        assert_eq!(broker.queued("svc"), 1);
        let (tx, mut rx) = mpsc::channel(1);
        provider
            .subscribe(CancellationToken::new(), "consumer", tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().id, env.id);
    }

    #[tokio::test]
    async fn purge_clears_queue() {
        let broker = InMemoryBroker::default();
        let provider = provider(&broker, &["orders"]).await;
        let env = Envelope::new("orders", "created", b"1".to_vec(), Policy::default());
        provider.publish(&env).await.unwrap();
        assert_eq!(broker.queued("svc"), 1);

        broker
            .connect()
            .init("svc", true, &["orders".to_owned()])
            .await
            .unwrap();
        assert_eq!(broker.queued("svc"), 0);
    }

    #[tokio::test]
    async fn publish_before_init_fails() {
        let broker = InMemoryBroker::default();
        let env = Envelope::new("orders", "created", b"1".to_vec(), Policy::default());
        assert!(broker.connect().publish(&env).await.is_err());
    }
}
