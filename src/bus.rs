//! Bus lifecycle and public surface.
//!
//! A [`Bus`] is configured first: routes are registered with
//! [`Bus::subscribe`] and a hook can be installed with [`Bus::with_hook`].
//! [`Bus::start`] consumes it, establishes the broker topology and the
//! outbox table, spawns the workers and returns a [`RunningBus`], the only
//! handle that can publish. Routes can therefore never change once
//! messages flow.
//!
//! ## Workers
//!
//! - `subscribers` consumers, each running deliveries through the router
//!   with retries
//! - one publisher, shared by every publish path
//! - the looper, rescanning unconfirmed outbox records (optional)
//! - `ackers` workers resolving broker confirms against the outbox
//!
//! Every worker observes a single [`CancellationToken`];
//! [`RunningBus::shutdown`] cancels it and closes the provider without
//! waiting for in-flight retries.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, MappedMutexGuard, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::acker::Acker;
use crate::config::{ConfigError, Options};
use crate::envelope::{Envelope, Policy};
use crate::hook::{BusHook, DefaultBusHook};
use crate::looper::Looper;
use crate::outbox::{Outbox, OutboxError, Scope, Store};
use crate::pool::Pool;
use crate::publisher::Publisher;
use crate::retry::Backoff;
use crate::router::{Route, Router};
use crate::subscriber::Subscriber;
use crate::transport::{Provider, TransportError};

/// A bus being configured.
pub struct Bus<S, P> {
    service: String,
    store: Arc<S>,
    provider: Arc<P>,
    options: Options,
    router: Router,
    hook: Arc<dyn BusHook>,
}

impl<S, P> Bus<S, P>
where
    S: Store,
    P: Provider,
{
    /// Create a bus for `service` over a store and a broker provider.
    pub fn new(service: impl Into<String>, store: Arc<S>, provider: Arc<P>, options: Options) -> Self {
        let router = Router::new(options.pool_capacity);
        Self {
            service: service.into(),
            store,
            provider,
            options,
            router,
            hook: Arc::new(DefaultBusHook),
        }
    }

    /// Replace the default logging hook.
    pub fn with_hook(mut self, hook: impl BusHook) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Register middleware and handlers for `topic`.
    pub fn subscribe(&mut self, topic: impl Into<String>) -> Route<'_> {
        self.router.route(topic)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Start every worker and return the running bus.
    ///
    /// In order: validate the options, initialise the broker topology for
    /// the registered topics, migrate (and optionally purge) the outbox,
    /// then start subscribers, the publisher, the looper and the ackers.
    #[instrument(skip(self), fields(service = %self.service))]
    pub async fn start(self) -> Result<RunningBus<S, P>, BusError> {
        self.options.validate(&self.service)?;

        let topics = self.router.topics();
        self.provider
            .init(&self.service, self.options.purge_on_startup, &topics)
            .await?;

        let outbox = Outbox::new(Arc::clone(&self.store), &self.service);
        outbox.migrate().await?;
        if self.options.purge_on_startup {
            outbox.purge().await?;
        }

        let cancel = CancellationToken::new();
        let mut deliveries = Vec::with_capacity(self.options.subscribers);
        for id in 0..self.options.subscribers {
            let (tx, rx) = mpsc::channel(1);
            let tag = Subscriber::tag(&self.service, id);
            if let Err(error) = self.provider.subscribe(cancel.clone(), &tag, tx).await {
                cancel.cancel();
                return Err(error.into());
            }
            deliveries.push(rx);
        }

        let router = Arc::new(self.router);
        let backoff = Backoff::new(self.options.retry_interval);
        for (id, rx) in deliveries.into_iter().enumerate() {
            let subscriber = Subscriber {
                id,
                router: Arc::clone(&router),
                hook: Arc::clone(&self.hook),
                backoff,
                retry_count: self.options.retry_count,
            };
            tokio::spawn(subscriber.run(cancel.clone(), rx));
        }

        let publisher = Arc::new(Publisher::new(
            outbox.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.hook),
        ));
        let confirms = Arc::new(publisher.start(self.options.confirm_buffer));

        if self.options.looper_enabled {
            let looper = Looper {
                outbox: outbox.clone(),
                publisher: Arc::clone(&publisher),
                hook: Arc::clone(&self.hook),
                limit: self.options.scan_limit,
                interval: self.options.scan_interval,
                min_age: self.options.scan_min_age,
            };
            tokio::spawn(looper.run(cancel.clone()));
        }

        for id in 0..self.options.ackers {
            let acker = Acker {
                id,
                publisher: Arc::clone(&publisher),
                confirms: Arc::clone(&confirms),
                hook: Arc::clone(&self.hook),
            };
            tokio::spawn(acker.run(cancel.clone()));
        }

        self.hook.on_started(&self.service);
        Ok(RunningBus {
            inner: Arc::new(Inner {
                envelopes: Pool::new(self.options.pool_capacity),
                service: self.service,
                outbox,
                publisher,
                provider: self.provider,
                hook: self.hook,
            }),
            cancel,
        })
    }
}

struct Inner<S, P> {
    service: String,
    outbox: Outbox<S>,
    publisher: Arc<Publisher<S, P>>,
    provider: Arc<P>,
    hook: Arc<dyn BusHook>,
    envelopes: Pool<Envelope>,
}

impl<S, P> Inner<S, P>
where
    S: Store,
    P: Provider,
{
    fn envelope(
        &self,
        topic: &str,
        handler: &str,
        payload: impl Into<Vec<u8>>,
        policy: Policy,
    ) -> Envelope {
        let mut envelope = self.envelopes.get();
        envelope.reset(topic, handler, payload, policy);
        envelope.service.push_str(&self.service);
        envelope
    }

    /// Submit in the background, then return the envelopes to the pool.
    fn dispatch(inner: &Arc<Self>, envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            inner.publisher.publish(&envelopes).await;
            for envelope in envelopes {
                inner.envelopes.put(envelope);
            }
        });
    }
}

/// A started bus.
pub struct RunningBus<S, P> {
    inner: Arc<Inner<S, P>>,
    cancel: CancellationToken,
}

impl<S, P> RunningBus<S, P>
where
    S: Store,
    P: Provider,
{
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn outbox(&self) -> &Outbox<S> {
        &self.inner.outbox
    }

    /// Publish a message outside any caller transaction.
    ///
    /// With a confirm policy the message is staged in the outbox first and
    /// a staging failure is returned; the broker submission itself happens
    /// in the background and is retried by the looper until confirmed.
    /// Without confirm the message is fire-and-forget.
    #[instrument(skip(self, payload, policy), fields(service = %self.inner.service))]
    pub async fn publish(
        &self,
        topic: &str,
        handler: &str,
        payload: impl Into<Vec<u8>>,
        policy: Policy,
    ) -> Result<(), BusError> {
        let mut envelope = self.inner.envelope(topic, handler, payload, policy);
        if envelope.policy.confirm {
            if let Err(error) = self.inner.outbox.stage(Scope::Owned, &mut envelope).await {
                self.inner.envelopes.put(envelope);
                return Err(error.into());
            }
        }
        Inner::dispatch(&self.inner, vec![envelope]);
        Ok(())
    }

    /// Run `body` against a caller transaction.
    ///
    /// `body` receives a [`TxBus`] bound to `tx`; messages published through
    /// it are staged inside `tx`. If `body` fails, `tx` is rolled back and
    /// nothing is published. If it succeeds, `tx` is committed and the
    /// messages are submitted in the background. A commit failure is
    /// returned as a [`BusError`].
    pub async fn transaction<F, Fut, T, E>(&self, tx: S::Transaction, body: F) -> Result<T, E>
    where
        F: FnOnce(TxBus<S, P>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BusError>,
    {
        let state = Arc::new(Mutex::new(Some(TxState {
            tx,
            staged: Vec::new(),
        })));
        let tx_bus = TxBus {
            inner: Arc::clone(&self.inner),
            state: Arc::clone(&state),
        };
        let result = body(tx_bus).await;
        let finished = state.lock().await.take();
        let Some(TxState { tx, staged }) = finished else {
            return Err(BusError::new(BusErrorKind::TransactionFinished).into());
        };
        let store = self.inner.outbox.store();

        match result {
            Ok(value) => {
                if let Err(error) = store.commit(tx).await {
                    self.release(staged);
                    return Err(BusError::from(OutboxError::store(error)).into());
                }
                Inner::dispatch(&self.inner, staged);
                Ok(value)
            }
            Err(err) => {
                if let Err(error) = store.rollback(tx).await {
                    tracing::error!(%error, "Transaction rollback failed");
                }
                self.release(staged);
                Err(err)
            }
        }
    }

    fn release(&self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            self.inner.envelopes.put(envelope);
        }
    }

    /// Stop every worker and close the provider.
    ///
    /// In-flight handler retries are abandoned; their deliveries stay
    /// unsettled and are redelivered by the broker.
    #[instrument(skip(self), fields(service = %self.inner.service))]
    pub async fn shutdown(self) -> Result<(), BusError> {
        self.inner.hook.on_shutdown(&self.inner.service);
        self.cancel.cancel();
        self.inner.provider.exit().await.map_err(|error| {
            tracing::error!(%error, "Provider did not exit cleanly");
            BusError::from(error)
        })
    }
}

impl<S, P> Drop for RunningBus<S, P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Publishing handle bound to a caller transaction.
///
/// Clones share the transaction, so publishes may run concurrently; they
/// are serialized on the transaction and keep their order of acquisition.
/// Once the transaction body returns, every clone is detached and further
/// calls fail with [`BusErrorKind::TransactionFinished`].
pub struct TxBus<S: Store, P> {
    inner: Arc<Inner<S, P>>,
    state: Arc<Mutex<Option<TxState<S::Transaction>>>>,
}

impl<S: Store, P> Clone for TxBus<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            state: Arc::clone(&self.state),
        }
    }
}

struct TxState<T> {
    tx: T,
    staged: Vec<Envelope>,
}

impl<S, P> TxBus<S, P>
where
    S: Store,
    P: Provider,
{
    /// Lock the caller transaction for business writes.
    ///
    /// The guard must be dropped before calling [`TxBus::publish`].
    pub async fn transaction(&self) -> Result<MappedMutexGuard<'_, S::Transaction>, BusError> {
        MutexGuard::try_map(self.state.lock().await, |state| {
            state.as_mut().map(|state| &mut state.tx)
        })
        .map_err(|_| BusError::new(BusErrorKind::TransactionFinished))
    }

    /// Publish a message once the transaction commits.
    ///
    /// With a confirm policy the message is staged inside the transaction
    /// right away; a staging failure is returned and should fail the body.
    pub async fn publish(
        &self,
        topic: &str,
        handler: &str,
        payload: impl Into<Vec<u8>>,
        policy: Policy,
    ) -> Result<(), BusError> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Err(BusError::new(BusErrorKind::TransactionFinished));
        };
        let mut envelope = self.inner.envelope(topic, handler, payload, policy);
        if envelope.policy.confirm {
            if let Err(error) = self
                .inner
                .outbox
                .stage(Scope::Within(&mut state.tx), &mut envelope)
                .await
            {
                self.inner.envelopes.put(envelope);
                return Err(error.into());
            }
        }
        state.staged.push(envelope);
        Ok(())
    }
}

/// Error returned by bus operations.
///
/// Wraps the failing component error and captures a tracing span
/// backtrace for improved diagnostics.
#[derive(Debug)]
pub struct BusError {
    context: SpanTrace,
    kind: BusErrorKind,
}

/// Bus error kinds.
#[derive(Debug)]
pub enum BusErrorKind {
    /// The options or the service name are invalid.
    Config(ConfigError),
    /// Errors originating from the outbox.
    Outbox(OutboxError),
    /// Errors originating from the broker provider.
    Transport(TransportError),
    /// A [`TxBus`] was used after its transaction body returned.
    TransactionFinished,
}

impl BusError {
    fn new(kind: BusErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &BusErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BusErrorKind::Config(err) => writeln!(f, "Invalid configuration: {err}"),
            BusErrorKind::Outbox(err) => writeln!(f, "Outbox error: {err}"),
            BusErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
            BusErrorKind::TransactionFinished => writeln!(f, "Transaction already finished"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            BusErrorKind::Config(err) => Some(err),
            BusErrorKind::Outbox(err) => Some(err),
            BusErrorKind::Transport(err) => Some(err),
            BusErrorKind::TransactionFinished => None,
        }
    }
}

impl From<ConfigError> for BusError {
    fn from(err: ConfigError) -> Self {
        Self::new(BusErrorKind::Config(err))
    }
}

impl From<OutboxError> for BusError {
    fn from(err: OutboxError) -> Self {
        Self::new(BusErrorKind::Outbox(err))
    }
}

impl From<TransportError> for BusError {
    fn from(err: TransportError) -> Self {
        Self::new(BusErrorKind::Transport(err))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ConfigErrorKind;
    use crate::outbox::inmemory::InMemoryStore;
    use crate::router::Context;
    use crate::transport::{InMemoryBroker, InMemoryProvider};

    fn bus(options: Options) -> (InMemoryStore, Bus<InMemoryStore, InMemoryProvider>) {
        let store = InMemoryStore::default();
        let broker = InMemoryBroker::default();
        let bus = Bus::new("svc", Arc::new(store.clone()), Arc::new(broker.connect()), options);
        (store, bus)
    }

    #[tokio::test]
    async fn start_rejects_invalid_options() {
        let (_store, bus) = bus(Options::default().with_ackers(0));
        let err = bus.start().await.err().unwrap();
        match err.kind() {
            BusErrorKind::Config(err) => assert_eq!(err.kind(), &ConfigErrorKind::NoAckers),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_creates_the_outbox_table() {
        let (store, bus) = bus(Options::default());
        let running = bus.start().await.unwrap();
        assert_eq!(running.outbox().table(), "courier_svc_outbox");
        assert_eq!(store.count(running.outbox().table()), 0);
        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rolled_back_transaction_releases_envelopes() {
        let (store, mut bus) = bus(Options::default().with_looper(false));
        bus.subscribe("orders")
            .handler("created", |_ctx: &mut Context| Box::pin(async { Ok(()) }));
        let running = bus.start().await.unwrap();

        let tx = store.begin().await.unwrap();
        let result: Result<(), BusError> = running
            .transaction(tx, |tx_bus| async move {
                tx_bus.transaction().await?.insert("orders", b"order".to_vec());
                tx_bus
                    .publish("orders", "created", b"1".to_vec(), Policy::default())
                    .await?;
                Err::<(), _>(BusError::new(BusErrorKind::TransactionFinished))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.count("orders"), 0);
        assert_eq!(store.count(running.outbox().table()), 0);
        assert_eq!(running.inner.envelopes.idle(), 1);
        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_publishes_in_a_transaction_are_all_staged() {
        let (store, bus) = bus(Options::default().with_looper(false));
        let running = bus.start().await.unwrap();
        running.inner.provider.exit().await.unwrap();

        let tx = store.begin().await.unwrap();
        running
            .transaction(tx, |tx_bus| async move {
                let (a, b) = tokio::join!(
                    tx_bus.publish("orders", "created", b"a".to_vec(), Policy::default()),
                    tx_bus.publish("orders", "created", b"b".to_vec(), Policy::default()),
                );
                a?;
                b?;
                Ok::<_, BusError>(())
            })
            .await
            .unwrap();

        assert_eq!(store.count(running.outbox().table()), 2);
    }

    #[tokio::test]
    async fn tx_bus_outliving_its_body_is_detached() {
        let (store, bus) = bus(Options::default().with_looper(false));
        let running = bus.start().await.unwrap();

        let tx = store.begin().await.unwrap();
        let leaked = running
            .transaction(tx, |tx_bus| async move { Ok::<_, BusError>(tx_bus.clone()) })
            .await
            .unwrap();

        let err = leaked
            .publish("orders", "created", b"late".to_vec(), Policy::default())
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), BusErrorKind::TransactionFinished));
        assert!(leaked.transaction().await.is_err());
        assert_eq!(store.count(running.outbox().table()), 0);
        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn confirmed_publish_survives_broker_outage() {
        let (store, bus) = bus(Options::default().with_looper(false));
        let running = bus.start().await.unwrap();
        running.inner.provider.exit().await.unwrap();

        running
            .publish("orders", "created", b"1".to_vec(), Policy::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.count(running.outbox().table()), 1);
    }
}
