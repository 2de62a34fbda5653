//! Lifecycle hooks of a running bus.

use crate::Envelope;

/// Hook trait for observing bus lifecycle events.
///
/// Hooks are invoked synchronously from the bus workers and should avoid
/// heavy or blocking work. Typical use cases include logging, metrics, and
/// tracing integration.
pub trait BusHook: Send + Sync + 'static {
    fn on_started(&self, service: &str);
    fn on_shutdown(&self, service: &str);
    fn on_published(&self, envelope: &Envelope);
    fn on_publish_error(&self, envelope: &Envelope, error: &dyn std::error::Error);
    fn on_confirmed(&self, sequence: u64, record_id: Option<i64>);
    fn on_confirm_error(&self, sequence: u64, error: &dyn std::error::Error);
    fn on_nack(&self, sequence: u64);
    fn on_rescanned(&self, count: usize);
    fn on_rescan_error(&self, error: &dyn std::error::Error);
    fn on_handled(&self, envelope: &Envelope, attempt: u32);
    fn on_handler_error(&self, envelope: &Envelope, attempt: u32, error: &dyn std::error::Error);
    fn on_rejected(&self, envelope: &Envelope, error: &dyn std::error::Error);
}

/// Default bus hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultBusHook;

impl BusHook for DefaultBusHook {
    fn on_started(&self, service: &str) {
        tracing::info!(service, "Bus started");
    }

    fn on_shutdown(&self, service: &str) {
        tracing::info!(service, "Bus is shutting down");
    }

    fn on_published(&self, envelope: &Envelope) {
        tracing::debug!(id = %envelope.id, topic = %envelope.topic, "Message published");
    }

    fn on_publish_error(&self, envelope: &Envelope, error: &dyn std::error::Error) {
        tracing::error!(id = %envelope.id, topic = %envelope.topic, %error, "Error publishing message");
    }

    fn on_confirmed(&self, sequence: u64, record_id: Option<i64>) {
        tracing::debug!(sequence, ?record_id, "Publish confirmed");
    }

    fn on_confirm_error(&self, sequence: u64, error: &dyn std::error::Error) {
        tracing::error!(sequence, %error, "Failed to remove confirmed message from outbox");
    }

    fn on_nack(&self, sequence: u64) {
        tracing::error!(sequence, "Broker refused message, leaving it for rescan");
    }

    fn on_rescanned(&self, count: usize) {
        if count > 0 {
            tracing::info!(count, "Resubmitting unconfirmed messages");
        }
    }

    fn on_rescan_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Outbox rescan failed");
    }

    fn on_handled(&self, envelope: &Envelope, attempt: u32) {
        tracing::debug!(id = %envelope.id, attempt, "Message handled");
    }

    fn on_handler_error(&self, envelope: &Envelope, attempt: u32, error: &dyn std::error::Error) {
        tracing::warn!(id = %envelope.id, attempt, %error, "Handler failed");
    }

    fn on_rejected(&self, envelope: &Envelope, error: &dyn std::error::Error) {
        tracing::error!(
            id = %envelope.id,
            topic = %envelope.topic,
            handler = %envelope.handler,
            %error,
            "Retries exhausted, rejecting message"
        );
    }
}
