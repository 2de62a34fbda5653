use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, HeaderValue, Outcome};
use crate::transport::{Provider, TransportError};

/// AMQP header carrying the envelope topic.
pub const TOPIC_HEADER: &str = "x-courier-topic";
/// AMQP header carrying the envelope handler name.
pub const HANDLER_HEADER: &str = "x-courier-handler";

/// RabbitMQ provider.
///
/// ## Topology
///
/// - one durable **topic exchange per topic**, routing key = topic
/// - one durable queue named after the service, bound to every subscribed
///   topic exchange
/// - rejected deliveries are dead-lettered through the fanout exchange
///   `<service>_exchange_dlx` into the queue `<service>_dlx`
///
/// ## Mapping
///
/// - `Envelope` → message body (binary codec)
/// - `Envelope.id` → `message_id`
/// - `Envelope.handler` → `type`
/// - `Envelope.service` → `reply_to`
/// - `Policy.durable` → persistent delivery mode
/// - `Policy.ttl` → `expiration` (milliseconds)
/// - `Policy.delay` → `x-delay` header (milliseconds)
/// - `Envelope.header` → AMQP message headers
///
/// Confirm-tracked envelopes are published on a channel in confirm mode;
/// the others go through a plain channel.
pub struct RabbitMq {
    uri: String,
    session: Mutex<Option<Session>>,
    confirms: Mutex<Option<(mpsc::Sender<u64>, mpsc::Sender<u64>)>>,
    sequence: AtomicU64,
}

#[derive(Clone)]
struct Session {
    connection: Arc<Connection>,
    confirm: Channel,
    plain: Channel,
    declared: Arc<Mutex<HashSet<String>>>,
    service: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RabbitMq {
    /// Create a provider for the broker at `uri`. The connection is opened
    /// by [`Provider::init`].
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            session: Mutex::new(None),
            confirms: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    fn session(&self) -> Result<Session, TransportError> {
        lock(&self.session).clone().ok_or_else(TransportError::closed)
    }

    async fn declare_exchange(
        &self,
        session: &Session,
        exchange: &str,
    ) -> Result<(), TransportError> {
        if lock(&session.declared).contains(exchange) {
            return Ok(());
        }
        session
            .plain
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(TransportError::broker)?;
        lock(&session.declared).insert(exchange.to_owned());
        Ok(())
    }

    fn properties(envelope: &Envelope) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(
            TOPIC_HEADER.into(),
            AMQPValue::LongString(LongString::from(envelope.topic.as_str())),
        );
        headers.insert(
            HANDLER_HEADER.into(),
            AMQPValue::LongString(LongString::from(envelope.handler.as_str())),
        );
        for (key, value) in envelope.header.iter() {
            let value = match value {
                HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
                HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
                HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.as_str())),
                HeaderValue::Bytes(v) => AMQPValue::ByteArray(v.clone().into()),
            };
            headers.insert(ShortString::from(key.as_str()), value);
        }
        if let Some(delay) = envelope.policy.delay {
            headers.insert(
                "x-delay".into(),
                AMQPValue::LongLongInt(delay.as_millis() as i64),
            );
        }

        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(envelope.id.to_string()))
            .with_kind(ShortString::from(envelope.handler.as_str()))
            .with_reply_to(ShortString::from(envelope.service.as_str()))
            .with_delivery_mode(if envelope.policy.durable { 2 } else { 1 })
            .with_headers(headers);
        if !envelope.policy.ttl.is_zero() {
            properties = properties.with_expiration(ShortString::from(
                envelope.policy.ttl.as_millis().to_string(),
            ));
        }
        properties
    }
}

#[async_trait]
impl Provider for RabbitMq {
    #[tracing::instrument(skip(self, topics))]
    async fn init(
        &self,
        service: &str,
        purge: bool,
        topics: &[String],
    ) -> Result<(), TransportError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(TransportError::broker)?;
        let plain = connection
            .create_channel()
            .await
            .map_err(TransportError::broker)?;
        let confirm = connection
            .create_channel()
            .await
            .map_err(TransportError::broker)?;
        confirm
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(TransportError::broker)?;

        let session = Session {
            connection: Arc::new(connection),
            confirm,
            plain,
            declared: Arc::default(),
            service: service.to_owned(),
        };

        let dlx = format!("{service}_exchange_dlx");
        let dlq = format!("{service}_dlx");
        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        session
            .plain
            .exchange_declare(
                &dlx,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(TransportError::broker)?;

        if purge {
            for queue in [service, dlq.as_str()] {
                let dropped = session
                    .plain
                    .queue_delete(queue, QueueDeleteOptions::default())
                    .await
                    .map_err(TransportError::broker)?;
                tracing::info!(queue, dropped, "Queue purged");
            }
        }

        session
            .plain
            .queue_declare(&dlq, durable, FieldTable::default())
            .await
            .map_err(TransportError::broker)?;
        session
            .plain
            .queue_bind(&dlq, &dlx, "", QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(TransportError::broker)?;

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
        session
            .plain
            .queue_declare(service, durable, arguments)
            .await
            .map_err(TransportError::broker)?;

        for topic in topics {
            self.declare_exchange(&session, topic).await?;
            session
                .plain
                .queue_bind(
                    service,
                    topic,
                    topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(TransportError::broker)?;
        }

        self.sequence.store(0, Ordering::SeqCst);
        *lock(&self.session) = Some(session);
        tracing::info!(?topics, "RabbitMQ provider initialized");
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let session = self.session()?;
        self.declare_exchange(&session, &envelope.topic).await?;
        let body = envelope.encode().map_err(TransportError::codec)?;
        let properties = Self::properties(envelope);

        if !envelope.policy.confirm {
            session
                .plain
                .basic_publish(
                    &envelope.topic,
                    &envelope.topic,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await
                .map_err(TransportError::broker)?;
            return Ok(());
        }

        let confirm = session
            .confirm
            .basic_publish(
                &envelope.topic,
                &envelope.topic,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(TransportError::broker)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let Some((ack, nack)) = lock(&self.confirms).clone() else {
            return Ok(());
        };
        tokio::spawn(async move {
            let sent = match confirm.await {
                Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => {
                    ack.send(sequence).await.is_ok()
                }
                Ok(Confirmation::Nack(_)) => nack.send(sequence).await.is_ok(),
                Err(error) => {
                    tracing::warn!(%error, sequence, "Publisher confirm lost, reporting it as a nack");
                    nack.send(sequence).await.is_ok()
                }
            };
            if !sent {
                tracing::warn!(sequence, "Confirm channel closed");
            }
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        consumer_tag: &str,
        output: mpsc::Sender<Envelope>,
    ) -> Result<(), TransportError> {
        let session = self.session()?;
        let channel = session
            .connection
            .create_channel()
            .await
            .map_err(TransportError::broker)?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(TransportError::broker)?;
        let mut consumer = channel
            .basic_consume(
                &session.service,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(TransportError::broker)?;
        let consumer_tag = consumer_tag.to_owned();

        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = cancel.cancelled() => break,
                    delivery = consumer.next() => delivery,
                };
                let delivery = match delivery {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(error)) => {
                        tracing::error!(%error, consumer_tag, "Consumer failed");
                        break;
                    }
                    None => break,
                };

                let mut envelope = match Envelope::decode(&delivery.data) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        tracing::error!(%error, consumer_tag, "Dead-lettering undecodable message");
                        if let Err(error) = delivery
                            .acker
                            .reject(BasicRejectOptions { requeue: false })
                            .await
                        {
                            tracing::warn!(%error, consumer_tag, "Failed to reject undecodable message");
                        }
                        continue;
                    }
                };
                let outcome = envelope.track();

                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = output.send(envelope) => sent.is_ok(),
                };
                let outcome = if sent {
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        outcome = outcome => outcome.ok(),
                    }
                } else {
                    None
                };

                let settled = match outcome {
                    Some(Outcome::Ack) => delivery.acker.ack(BasicAckOptions::default()).await,
                    Some(Outcome::Reject) => {
                        delivery
                            .acker
                            .reject(BasicRejectOptions { requeue: false })
                            .await
                    }
                    None => {
                        if let Err(error) = delivery
                            .acker
                            .nack(BasicNackOptions {
                                requeue: true,
                                ..Default::default()
                            })
                            .await
                        {
                            tracing::warn!(%error, consumer_tag, "Failed to requeue abandoned delivery");
                        }
                        if cancel.is_cancelled() || output.is_closed() {
                            break;
                        }
                        continue;
                    }
                };
                if let Err(error) = settled {
                    tracing::error!(%error, consumer_tag, "Failed to settle delivery");
                }
            }
            if let Err(error) = channel.close(200, "consumer stopped").await {
                tracing::debug!(%error, consumer_tag, "Channel already closed");
            }
        });
        Ok(())
    }

    fn notify_confirm(&self, ack: mpsc::Sender<u64>, nack: mpsc::Sender<u64>) {
        *lock(&self.confirms) = Some((ack, nack));
    }

    async fn exit(&self) -> Result<(), TransportError> {
        let session = lock(&self.session).take();
        *lock(&self.confirms) = None;
        if let Some(session) = session {
            session
                .connection
                .close(200, "bye")
                .await
                .map_err(TransportError::broker)?;
        }
        Ok(())
    }
}
