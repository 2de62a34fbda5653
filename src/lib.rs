#![doc = include_str!("../README.md")]

mod acker;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod hook;
mod looper;
pub mod outbox;
pub mod pool;
mod publisher;
pub mod retry;
pub mod router;
mod subscriber;
pub mod transport;

#[doc(inline)]
pub use bus::{Bus, BusError, BusErrorKind, RunningBus, TxBus};

#[doc(inline)]
pub use config::{ConfigError, ConfigErrorKind, Options};

#[doc(inline)]
pub use envelope::{Envelope, Header, HeaderValue, Outcome, Policy};

#[doc(inline)]
pub use hook::{BusHook, DefaultBusHook};

#[doc(inline)]
pub use outbox::{inmemory::InMemoryStore, Outbox, OutboxError, OutboxErrorKind, Scope, Store};

#[doc(inline)]
pub use router::{Context, Handler, HandlerResult, NoMatchingHandler};

#[doc(inline)]
pub use transport::{InMemoryBroker, InMemoryProvider, Provider, TransportError, TransportErrorKind};
