//! Inbound message routing.
//!
//! Handlers are registered per `(topic, handler name)` before the bus
//! starts; every topic can also carry an ordered list of middleware that
//! runs in front of each of its handlers. For every delivery the router
//! builds the chain `[middleware..., handler]` on a pooled [`Context`] and
//! runs it. A delivery addressed to an unknown handler fails with
//! [`NoMatchingHandler`].

mod context;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_core::future::BoxFuture;

use crate::pool::Pool;
use crate::Envelope;

pub use context::Context;

/// Result of a handler or middleware.
pub type HandlerResult = Result<(), tower::BoxError>;

/// A handler or middleware in a routing chain.
///
/// Implemented for every closure of the shape
/// `Fn(&mut Context) -> BoxFuture<'_, HandlerResult>`.
pub trait Handler: Send + Sync + 'static {
    fn call<'c>(&'c self, ctx: &'c mut Context) -> BoxFuture<'c, HandlerResult>;
}

impl<F> Handler for F
where
    F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, HandlerResult> + Send + Sync + 'static,
{
    fn call<'c>(&'c self, ctx: &'c mut Context) -> BoxFuture<'c, HandlerResult> {
        (self)(ctx)
    }
}

/// Error returned for a delivery without a registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoMatchingHandler {
    pub topic: String,
    pub handler: String,
}

impl std::fmt::Display for NoMatchingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no handler registered for {}/{}", self.topic, self.handler)
    }
}

impl std::error::Error for NoMatchingHandler {}

fn no_matching_handler<'c>(ctx: &'c mut Context) -> BoxFuture<'c, HandlerResult> {
    let err = NoMatchingHandler {
        topic: ctx.topic().to_owned(),
        handler: ctx.handler_name().to_owned(),
    };
    let result: HandlerResult = Err(err.into());
    Box::pin(async move { result })
}

/// Routing table from `(topic, handler)` to handler, plus per-topic
/// middleware.
pub struct Router {
    handlers: HashMap<(String, String), Arc<dyn Handler>>,
    middleware: BTreeMap<String, Vec<Arc<dyn Handler>>>,
    fallback: Arc<dyn Handler>,
    contexts: Pool<Context>,
}

impl Router {
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            handlers: HashMap::new(),
            middleware: BTreeMap::new(),
            fallback: Arc::new(no_matching_handler),
            contexts: Pool::new(pool_capacity),
        }
    }

    /// Start a registration for `topic`.
    pub fn route(&mut self, topic: impl Into<String>) -> Route<'_> {
        let topic = topic.into();
        self.middleware.entry(topic.clone()).or_default();
        Route {
            router: self,
            topic,
        }
    }

    /// Every topic with at least one registration, in name order.
    pub fn topics(&self) -> Vec<String> {
        self.middleware.keys().cloned().collect()
    }

    /// Run the chain for `envelope` and return its outcome.
    pub async fn handle(&self, envelope: &Arc<Envelope>) -> HandlerResult {
        let mut ctx = self.contexts.get();
        let chain = self
            .middleware
            .get(&envelope.topic)
            .into_iter()
            .flatten()
            .cloned()
            .chain(std::iter::once(
                self.handlers
                    .get(&(envelope.topic.clone(), envelope.handler.clone()))
                    .cloned()
                    .unwrap_or_else(|| Arc::clone(&self.fallback)),
            ));
        ctx.reset(Arc::clone(envelope), chain);
        let result = ctx.next().await;
        self.contexts.put(ctx);
        result
    }
}

/// Registration handle for one topic.
pub struct Route<'a> {
    router: &'a mut Router,
    topic: String,
}

impl Route<'_> {
    /// Append middleware to the topic. Middleware runs in registration
    /// order before the handler and continues the chain with
    /// [`Context::next`].
    pub fn middleware<F>(self, middleware: F) -> Self
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, HandlerResult> + Send + Sync + 'static,
    {
        self.router
            .middleware
            .entry(self.topic.clone())
            .or_default()
            .push(Arc::new(middleware));
        self
    }

    /// Register the handler named `name` on the topic, replacing any
    /// previous one.
    pub fn handler<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, HandlerResult> + Send + Sync + 'static,
    {
        self.router
            .handlers
            .insert((self.topic.clone(), name.into()), Arc::new(handler));
        self
    }
}
