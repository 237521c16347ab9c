//! Top-level assembly: builds the runtime bottom-up (connection manager,
//! dispatchers, confirmed publisher) and exposes the typed publish/subscribe
//! surface. Construction is explicit; there is no container anywhere.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::channel::{channel_action, open_hook, ChannelAction, OpenHook};
use crate::config::BrokerConfig;
use crate::confirms::ConfirmedPublisher;
use crate::connection::ConnectionManager;
use crate::consumer::{delivery_handler, Consumer, DeliveryHandler, HandlerOutcome};
use crate::dispatch::{CommandDispatcher, OutboundDispatcher};
use crate::errors::{BusError, Result};
use crate::naming::{Conventions, DefaultConventions};
use crate::serialize::JsonSerializer;
use crate::topology::{ExchangeSpec, QueueSpec};
use crate::transport::lapin::LapinTransport;
use crate::transport::{ConsumeOptions, PublishArgs, Transport};

/// Wrap publish arguments into a replayable channel action.
pub fn publish_action(args: PublishArgs) -> ChannelAction {
    channel_action(move |channel| {
        let args = args.clone();
        async move { channel.basic_publish(&args).await }
    })
}

/// Unqualified type name used for convention-based exchange/queue naming.
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

pub struct MessageBus {
    config: BrokerConfig,
    serializer: JsonSerializer,
    conventions: Arc<dyn Conventions>,
    connection: Arc<ConnectionManager>,
    commands: Arc<CommandDispatcher>,
    outbound: Arc<OutboundDispatcher>,
    publisher: Option<Arc<ConfirmedPublisher>>,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    declared_exchanges: Mutex<HashSet<String>>,
    disposed: AtomicBool,
}

impl MessageBus {
    /// Connect over AMQP using the production transport.
    pub async fn connect(config: BrokerConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(LapinTransport::new(config.uri()));
        Self::start(config, transport).await
    }

    /// Build every component bottom-up against an arbitrary transport.
    pub async fn start(config: BrokerConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let connection = ConnectionManager::start(transport, config.reconnect());

        let prefetch = config.prefetch_count;
        let qos_hook: OpenHook = open_hook(move |channel| async move {
            if prefetch > 0 {
                channel.basic_qos(prefetch).await?;
            }
            Ok(())
        });

        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        let confirms_enabled = config.publisher_confirms;
        let confirm_hook: OpenHook = open_hook(move |channel| {
            let confirm_tx = confirm_tx.clone();
            async move {
                if confirms_enabled {
                    channel.confirm_select().await?;
                    let confirm_tx = confirm_tx.clone();
                    channel.on_confirm(Arc::new(move |event| {
                        let _ = confirm_tx.send(event);
                    }));
                }
                Ok(())
            }
        });

        let commands = CommandDispatcher::start(
            connection.clone(),
            config.timeout(),
            vec![qos_hook.clone(), confirm_hook],
        );
        let outbound = OutboundDispatcher::start(
            connection.clone(),
            config.timeout(),
            config.reconnect(),
            vec![qos_hook],
        );
        let publisher = if confirms_enabled {
            Some(ConfirmedPublisher::start(
                commands.clone(),
                connection.clone(),
                config.timeout(),
                confirm_rx,
            ))
        } else {
            None
        };

        info!(host = %config.host, port = config.port, "message bus assembled");
        Ok(Arc::new(Self {
            config,
            serializer: JsonSerializer,
            conventions: Arc::new(DefaultConventions),
            connection,
            commands,
            outbound,
            publisher,
            consumers: Mutex::new(Vec::new()),
            declared_exchanges: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub async fn wait_connected(&self, limit: std::time::Duration) -> Result<()> {
        self.connection.wait_connected(limit).await
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::Disposed("message bus"));
        }
        Ok(())
    }

    /// Publish pre-serialized content. With publisher confirms on, the
    /// returned future resolves once the broker acked the message; otherwise
    /// the message goes through the outbound dispatcher fire-and-forget.
    pub async fn publish_raw(&self, args: PublishArgs) -> Result<()> {
        self.ensure_live()?;
        let action = publish_action(args);
        match &self.publisher {
            Some(publisher) => publisher.publish(action).await,
            None => self.outbound.invoke(action).await,
        }
    }

    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<()> {
        let raw = self.serializer.serialize(message)?;
        self.publish_raw(PublishArgs {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: false,
            body: raw.body,
            properties: raw.properties,
        })
        .await
    }

    /// Convention-based publish: the exchange is named after the message
    /// type and declared on first use.
    pub async fn publish_message<T: Serialize>(&self, message: &T) -> Result<()> {
        let exchange = self.conventions.exchange_name(short_type_name::<T>());
        self.declare_exchange_once(&exchange).await?;
        self.publish(&exchange, "", message).await
    }

    async fn declare_exchange_once(&self, name: &str) -> Result<()> {
        {
            let declared = self.declared_exchanges.lock().await;
            if declared.contains(name) {
                return Ok(());
            }
        }
        let spec = ExchangeSpec::direct(name)?;
        self.commands
            .invoke(channel_action(move |channel| {
                let spec = spec.clone();
                async move { channel.declare_exchange(&spec).await }
            }))
            .await?;
        self.declared_exchanges.lock().await.insert(name.to_string());
        Ok(())
    }

    /// Start a consumer on an explicit queue. `recover = true` yields the
    /// persistent variant that redeclares itself after reconnects and
    /// broker-initiated cancels; `recover = false` yields the transient one.
    pub async fn consume(
        &self,
        queue: QueueSpec,
        handler: DeliveryHandler,
        recover: bool,
    ) -> Result<Arc<Consumer>> {
        self.ensure_live()?;
        let options = ConsumeOptions {
            exclusive: queue.exclusive,
            no_ack: false,
            cancel_on_ha_failover: self.config.cancel_on_ha_failover,
        };
        let consumer = Consumer::start(
            queue,
            self.conventions.consumer_tag(),
            handler,
            self.commands.clone(),
            self.connection.clone(),
            options,
            recover,
        )
        .await?;
        self.consumers.lock().await.push(consumer.clone());
        Ok(consumer)
    }

    /// Convention-based durable subscription: declares the exchange, the
    /// dead-letter pair and a durable queue, binds them, then consumes with
    /// the persistent (recovering) consumer. Handler success acks; handler
    /// errors nack without requeue, landing the message in the dead-letter
    /// queue.
    pub async fn subscribe<T, F, Fut>(
        &self,
        subscription_id: &str,
        handler: F,
    ) -> Result<Arc<Consumer>>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_live()?;
        if subscription_id.is_empty() {
            return Err(BusError::InvalidArgument(
                "subscription_id cannot be empty".into(),
            ));
        }
        let message_type = short_type_name::<T>();
        let exchange = self.conventions.exchange_name(message_type);
        let queue_name = self.conventions.queue_name(message_type, subscription_id);
        let dlx = self.conventions.dead_letter_exchange_name(&exchange);
        let dlq = self.conventions.dead_letter_queue_name(&queue_name);

        let queue = QueueSpec::new(queue_name)?.with_dead_letter(dlx.clone());
        self.declare_subscription_topology(&exchange, &queue, &dlx, &dlq)
            .await?;

        let serializer = self.serializer;
        let wrapped = delivery_handler(move |delivery| {
            let parsed: Result<T> = serializer.deserialize(&delivery.body);
            let handled = match parsed {
                Ok(message) => Some(handler(message)),
                Err(_) => None,
            };
            async move {
                match handled {
                    Some(future) => {
                        future.await?;
                        Ok(HandlerOutcome::Ack)
                    }
                    // malformed payloads go straight to the dead-letter queue
                    None => Ok(HandlerOutcome::Nack { requeue: false }),
                }
            }
        });
        self.consume(queue, wrapped, true).await
    }

    async fn declare_subscription_topology(
        &self,
        exchange: &str,
        queue: &QueueSpec,
        dlx: &str,
        dlq: &str,
    ) -> Result<()> {
        let exchange_spec = ExchangeSpec::direct(exchange)?;
        let dlx_spec = ExchangeSpec::direct(dlx)?;
        let dlq_spec = QueueSpec::new(dlq)?;
        let queue_spec = queue.clone();
        let exchange_name = exchange.to_string();
        let dlx_name = dlx.to_string();
        self.commands
            .invoke(channel_action(move |channel| {
                let exchange_spec = exchange_spec.clone();
                let dlx_spec = dlx_spec.clone();
                let dlq_spec = dlq_spec.clone();
                let queue_spec = queue_spec.clone();
                let exchange_name = exchange_name.clone();
                let dlx_name = dlx_name.clone();
                async move {
                    channel.declare_exchange(&exchange_spec).await?;
                    channel.declare_exchange(&dlx_spec).await?;
                    let declared_dlq = channel.declare_queue(&dlq_spec).await?;
                    channel.bind_queue(&declared_dlq, &dlx_name, "").await?;
                    // brokers reject binds against undeclared queues, so the
                    // subscription queue goes in first; the consumer's later
                    // declare of the same queue is an idempotent redeclare
                    let declared = channel.declare_queue(&queue_spec).await?;
                    channel.bind_queue(&declared, &exchange_name, "").await
                }
            }))
            .await
    }

    /// Ordered teardown: consumers first (each taking its delivery queue
    /// with it), then the publisher (failing any still-pending confirms),
    /// then the dispatchers; the outbound dispatcher disposes the
    /// connection last. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing message bus");
        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for consumer in consumers {
            consumer.dispose().await;
        }
        if let Some(publisher) = &self.publisher {
            publisher.dispose().await;
        }
        self.commands.dispose().await;
        self.outbound.dispose().await;
        info!("message bus disposed");
    }
}
