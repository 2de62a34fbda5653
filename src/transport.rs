//! Broker abstraction and provider backends.
//!
//! The bus talks to the message broker exclusively through a [`Provider`].
//! A provider owns the broker topology (exchanges, queues, bindings), the
//! wire representation of an [`Envelope`], publisher confirms and consumer
//! deliveries.
//!
//! ## Key components
//!
//! - [`Provider`]: trait implemented by broker backends
//! - [`InMemoryBroker`]: in-process broker for tests and local pipelines
//! - [`rabbitmq::RabbitMq`]: RabbitMQ backend (feature `rabbitmq`)
//! - [`TransportError`]: unified error type with tracing context

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::{ConfirmMode, InMemoryBroker, InMemoryProvider};

/// Message broker collaborator.
///
/// ## Confirms
///
/// After [`Provider::notify_confirm`] the provider reports, for every
/// published envelope whose policy requires a confirm, the broker sequence
/// number on the ack channel (accepted) or on the nack channel (refused).
/// Sequence numbers start at 1 for a fresh provider session and increase by
/// one per confirm-tracked publish, in publish order.
///
/// ## Deliveries
///
/// [`Provider::subscribe`] pushes inbound envelopes to the given channel.
/// Each envelope is armed with [`Envelope::track`]; the provider settles the
/// underlying delivery according to the signalled
/// [`Outcome`](crate::envelope::Outcome), and leaves it unsettled when the
/// envelope is dropped without one.
#[async_trait::async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Establish the topology for `topics` under the `service` identity.
    ///
    /// With `purge` set, any pre-existing queue contents are discarded.
    async fn init(&self, service: &str, purge: bool, topics: &[String])
        -> Result<(), TransportError>;

    /// Submit one envelope.
    async fn publish(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Start delivering inbound envelopes to `output` until `cancel` fires.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        consumer_tag: &str,
        output: mpsc::Sender<Envelope>,
    ) -> Result<(), TransportError>;

    /// Route publisher confirms to the given channels.
    fn notify_confirm(&self, ack: mpsc::Sender<u64>, nack: mpsc::Sender<u64>);

    /// Release every broker resource.
    async fn exit(&self) -> Result<(), TransportError>;
}

/// Error returned by provider operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport error kinds.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the broker client.
    Broker(tower::BoxError),
    /// An envelope could not be encoded to or decoded from the wire.
    Codec(bitcode::Error),
    /// The provider was used before `init` or after `exit`.
    Closed,
}

impl TransportError {
    /// Create a broker-related transport error.
    pub fn broker(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Broker(err.into()),
        }
    }

    /// Create a wire codec error.
    pub fn codec(err: bitcode::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Codec(err),
        }
    }

    /// Create an error for a provider that is not connected.
    pub fn closed() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Closed,
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
            TransportErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
            TransportErrorKind::Closed => writeln!(f, "Provider is not connected"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Broker(err) => Some(err.as_ref()),
            TransportErrorKind::Codec(err) => Some(err),
            TransportErrorKind::Closed => None,
        }
    }
}
