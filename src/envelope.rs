//! The unit of transit.
//!
//! An [`Envelope`] carries everything the bus needs to route and deliver a
//! message: identity, destination (topic and handler name), the originating
//! service, a free-form [`Header`], the opaque payload and its delivery
//! [`Policy`].
//!
//! ## Completion
//!
//! Inbound envelopes handed out by a [`Provider`](crate::transport::Provider)
//! are *armed* with a single-fire completion signal (see [`Envelope::track`]).
//! Exactly one of [`Envelope::ack`] or [`Envelope::reject`] may be called on
//! an envelope; calling either a second time is a programming error and
//! panics.
//!
//! ## Codec
//!
//! Envelopes are persisted in the outbox with [`Envelope::encode`] /
//! [`Envelope::decode`], a compact binary encoding. The completion signal
//! is never encoded.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::pool::Recycle;

/// Header key under which the outbox record id of a staged envelope is kept.
pub const RECORD_ID: &str = "record_id";

/// Message container moved between the bus, the outbox and the broker.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message identifier.
    #[serde(with = "uuid_bytes")]
    pub id: Uuid,
    /// Destination topic.
    pub topic: String,
    /// Name of the handler the message is addressed to.
    pub handler: String,
    /// Name of the service that published the message.
    pub service: String,
    /// Transient metadata (e.g. the outbox record id).
    pub header: Header,
    /// Opaque message body.
    pub payload: Vec<u8>,
    /// Delivery policy.
    pub policy: Policy,
    #[serde(skip)]
    completion: Completion,
}

impl Envelope {
    /// Create a fresh envelope with a random id and the given policy.
    pub fn new(
        topic: impl Into<String>,
        handler: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        policy: Policy,
    ) -> Self {
        let mut envelope = Self::default();
        envelope.reset(topic, handler, payload, policy);
        envelope
    }

    /// Repopulate the envelope for a new publish.
    ///
    /// Every field is overwritten: a new id is drawn, the header is cleared
    /// and any completion signal left over from a previous use is dropped.
    /// The originating service is left empty for the caller to fill in.
    pub fn reset(
        &mut self,
        topic: impl Into<String>,
        handler: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        policy: Policy,
    ) {
        self.recycle();
        self.id = Uuid::new_v4();
        self.topic = topic.into();
        self.handler = handler.into();
        self.payload = payload.into();
        self.policy = policy;
    }

    /// Set the originating service name.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Outbox record id, if the envelope has been staged.
    pub fn record_id(&self) -> Option<i64> {
        self.header.get(RECORD_ID).and_then(HeaderValue::as_i64)
    }

    /// Payload interpreted as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Arm the completion signal and return the receiving half.
    ///
    /// Providers call this on every inbound envelope before handing it to a
    /// subscriber, then wait on the receiver to settle the underlying broker
    /// delivery. If the envelope is dropped without being completed the
    /// receiver resolves to an error and the delivery must be left unsettled.
    pub fn track(&mut self) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        *self.completion.lock() = Signal::Armed(tx);
        rx
    }

    /// Signal that the message was processed successfully.
    ///
    /// # Panics
    ///
    /// Panics if the envelope was already acknowledged or rejected.
    pub fn ack(&self) {
        self.completion.fire(self.id, Outcome::Ack);
    }

    /// Signal that the message could not be processed.
    ///
    /// # Panics
    ///
    /// Panics if the envelope was already acknowledged or rejected.
    pub fn reject(&self) {
        self.completion.fire(self.id, Outcome::Reject);
    }

    /// The outcome signalled so far, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.completion.lock() {
            Signal::Fired(outcome) => Some(*outcome),
            _ => None,
        }
    }

    /// Encode the envelope for durable storage.
    pub fn encode(&self) -> Result<Vec<u8>, bitcode::Error> {
        bitcode::serialize(self)
    }

    /// Decode an envelope previously produced by [`Envelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, bitcode::Error> {
        bitcode::deserialize(bytes)
    }
}

impl Recycle for Envelope {
    fn recycle(&mut self) {
        self.id = Uuid::nil();
        self.topic.clear();
        self.handler.clear();
        self.service.clear();
        self.header.clear();
        self.payload.clear();
        self.policy = Policy::default();
        self.completion = Completion::default();
    }
}

/// Final state of an inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; the broker may forget the delivery.
    Ack,
    /// Processing failed; the broker requeues or dead-letters the delivery.
    Reject,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Ack => write!(f, "acknowledged"),
            Outcome::Reject => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Default)]
enum Signal {
    #[default]
    Detached,
    Armed(oneshot::Sender<Outcome>),
    Fired(Outcome),
}

#[derive(Debug, Default)]
struct Completion(Mutex<Signal>);

impl Completion {
    fn lock(&self) -> std::sync::MutexGuard<'_, Signal> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, id: Uuid, outcome: Outcome) {
        let mut signal = self.lock();
        match std::mem::replace(&mut *signal, Signal::Fired(outcome)) {
            Signal::Detached => {}
            Signal::Armed(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(%id, %outcome, "Delivery no longer awaits completion");
                }
            }
            Signal::Fired(previous) => {
                *signal = Signal::Fired(previous);
                drop(signal);
                panic!("envelope {id} was already {previous}, cannot mark it {outcome}");
            }
        }
    }
}

/// Per-message delivery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Stage in the outbox and track the broker confirm.
    pub confirm: bool,
    /// Ask the broker to persist the message.
    pub durable: bool,
    /// Message expiration; zero means no expiration.
    pub ttl: Duration,
    /// Delivery delay, for brokers that support delayed delivery.
    pub delay: Option<Duration>,
}

impl Default for Policy {
    /// `confirm = true`, `durable = true`, no ttl, no delay.
    fn default() -> Self {
        Self {
            confirm: true,
            durable: true,
            ttl: Duration::ZERO,
            delay: None,
        }
    }
}

impl Policy {
    /// Policy for fire-and-forget messages: no outbox staging, no confirm.
    pub fn fire_and_forget() -> Self {
        Self::default().with_confirm(false)
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// String-keyed envelope metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header(BTreeMap<String, HeaderValue>);

impl Header {
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(key)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }
}

/// A header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        HeaderValue::Bytes(value)
    }
}

mod uuid_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(id: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
        id.as_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
        <[u8; 16]>::deserialize(deserializer).map(Uuid::from_bytes)
    }
}
