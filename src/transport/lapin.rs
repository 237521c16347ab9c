//! Production transport backed by the `lapin` AMQP client.
//!
//! lapin exposes publisher confirms as a per-publish future rather than as
//! raw ack/nack frames, so the adapter assigns sequence numbers itself and
//! forwards each resolved confirmation to the registered observers as a
//! single (non-multiple) ack or nack. The confirm tracker's multiple-flag
//! handling is exercised by brokers reached through other transports and by
//! the test fakes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_lite::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ::lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use ::lapin::publisher_confirm::Confirmation;
use ::lapin::types::{AMQPValue, FieldTable};
use ::lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use crate::errors::Result;
use crate::topology::{ExchangeSpec, ExchangeType, QueueSpec};
use crate::transport::{
    ConfirmCallback, ConfirmEvent, ConsumeOptions, ConsumerEvent, ConsumerStream, Delivery,
    ManagedChannel, ManagedConnection, MessageProperties, PublishArgs, ShutdownCallback,
    Transport,
};
use crate::util::lock;

/// Connects to a broker over AMQP using a URI from [`crate::BrokerConfig`].
pub struct LapinTransport {
    uri: String,
}

impl LapinTransport {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self) -> Result<Arc<dyn ManagedConnection>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        debug!("transport connection established");
        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl ManagedConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn ManagedChannel>> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(LapinChannel {
            inner: channel,
            sequence: AtomicU64::new(1),
            confirms_enabled: AtomicBool::new(false),
            confirm_observers: Mutex::new(Vec::new()),
        }))
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        self.inner.on_error(move |error| {
            callback(error.to_string());
        });
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(200, "client shutdown").await?;
        Ok(())
    }
}

struct LapinChannel {
    inner: Channel,
    sequence: AtomicU64,
    confirms_enabled: AtomicBool,
    confirm_observers: Mutex<Vec<ConfirmCallback>>,
}

impl LapinChannel {
    fn notify_confirm(observers: &[ConfirmCallback], event: ConfirmEvent) {
        for observer in observers {
            observer(event);
        }
    }
}

#[async_trait]
impl ManagedChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn confirm_select(&self) -> Result<()> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        self.confirms_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn on_confirm(&self, callback: ConfirmCallback) {
        lock(&self.confirm_observers).push(callback);
    }

    async fn basic_publish(&self, args: &PublishArgs) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let options = BasicPublishOptions {
            mandatory: args.mandatory,
            ..BasicPublishOptions::default()
        };
        let confirm = self
            .inner
            .basic_publish(
                &args.exchange,
                &args.routing_key,
                options,
                &args.body,
                to_basic_properties(&args.properties),
            )
            .await?;

        if self.confirms_enabled.load(Ordering::SeqCst) {
            let observers = lock(&self.confirm_observers).clone();
            tokio::spawn(async move {
                match confirm.await {
                    Ok(Confirmation::Nack(_)) => Self::notify_confirm(
                        &observers,
                        ConfirmEvent::Nack {
                            sequence,
                            multiple: false,
                        },
                    ),
                    Ok(_) => Self::notify_confirm(
                        &observers,
                        ConfirmEvent::Ack {
                            sequence,
                            multiple: false,
                        },
                    ),
                    Err(error) => {
                        // The channel died before the broker answered; the
                        // reconnect flow takes over from here.
                        debug!(%error, sequence, "publish confirmation dropped");
                    }
                }
            });
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String> {
        let options = QueueDeclareOptions {
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let declared = self
            .inner
            .queue_declare(&queue.name, options, to_field_table(&queue.arguments))
            .await?;
        Ok(declared.name().as_str().to_string())
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        let options = ExchangeDeclareOptions {
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(
                &exchange.name,
                to_exchange_kind(exchange.exchange_type),
                options,
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<ConsumerStream> {
        let mut arguments = FieldTable::default();
        if options.cancel_on_ha_failover {
            arguments.insert("x-cancel-on-ha-failover".into(), AMQPValue::Boolean(true));
        }
        let consume_options = BasicConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            ..BasicConsumeOptions::default()
        };
        let mut consumer = self
            .inner
            .basic_consume(queue, consumer_tag, consume_options, arguments)
            .await?;

        let tag = consumer.tag().as_str().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(attempt) = consumer.next().await {
                match attempt {
                    Ok(delivery) => {
                        let event = ConsumerEvent::Delivery(to_delivery(&stream_tag, delivery));
                        if events_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        warn!(%error, consumer_tag = %stream_tag, "delivery stream failed");
                        break;
                    }
                }
            }
            // Stream end means broker cancel or channel death.
            let _ = events_tx.send(ConsumerEvent::Cancelled);
        });

        Ok(ConsumerStream {
            tag,
            events: events_rx,
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.inner.basic_nack(delivery_tag, options).await?;
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(200, "channel disposed").await?;
        Ok(())
    }
}

fn to_exchange_kind(exchange_type: ExchangeType) -> ExchangeKind {
    match exchange_type {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn to_field_table(arguments: &[(String, String)]) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(
            key.as_str().into(),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    table
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.as_str().into());
    }
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(expiration.as_str().into());
    }
    if let Some(timestamp) = &properties.timestamp {
        basic = basic.with_timestamp(timestamp.timestamp() as u64);
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(2);
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(to_field_table(&properties.headers));
    }
    basic
}

fn to_delivery(consumer_tag: &str, delivery: ::lapin::message::Delivery) -> Delivery {
    let properties = MessageProperties {
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        reply_to: delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        expiration: delivery
            .properties
            .expiration()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        timestamp: delivery
            .properties
            .timestamp()
            .clone()
            .and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0)),
        persistent: delivery.properties.delivery_mode().clone() == Some(2),
        headers: Vec::new(),
    };
    Delivery {
        consumer_tag: consumer_tag.to_string(),
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties,
        body: delivery.data,
    }
}
