// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnecting Client
//!
//! This module provides the consumer/publisher unit of the crate. A `Client`
//! owns at most one exchange, at most one queue, one connection with one
//! channel over it, and the handler registry its dispatch loop routes
//! deliveries through.
//!
//! Setup failures during creation are returned to the caller and the client
//! is not handed out. After creation the client is self-healing: a dropped
//! connection or a failed publish recycles the transport through a fixed
//! backoff interval until the broker is reachable again, restoring the
//! routing keys that were bound before the failure. Publish calls block for
//! the duration of that recovery and are retried until they succeed.

use crate::{
    config::BrokerConfig,
    connection, dispatch,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::{DeliveryHandler, HandlerRegistry},
    message::{Envelope, HeaderValue},
    otel,
    queue::QueueDefinition,
};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, Consumer,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    time,
};
use tracing::{debug, error, info, warn};

/// Live transport state: one connection, one channel over it, and a delivery
/// stream a publish-triggered recovery may have left for the dispatch loop
/// to adopt.
struct Transport {
    connection: Option<Connection>,
    channel: Option<Channel>,
    pending_stream: Option<Consumer>,
}

/// A reconnecting consumer/publisher bound to one logical name.
///
/// Clients are created through
/// [`ClientRegistry::get_or_create`](crate::registry::ClientRegistry::get_or_create)
/// or directly via [`Client::connect`], and shared as `Arc<Client>`. A client
/// without a queue is publish-only and runs no dispatch loop.
pub struct Client {
    name: String,
    config: Arc<BrokerConfig>,
    exchange: Option<ExchangeDefinition>,
    queue: Option<QueueDefinition>,
    handlers: HandlerRegistry,
    bound_keys: Mutex<BTreeSet<String>>,
    transport: AsyncMutex<Transport>,
    failure_tx: mpsc::Sender<lapin::Error>,
    closed: AtomicBool,
}

impl Client {
    /// Dials the broker, declares the topology and starts the dispatch loop.
    ///
    /// Declares the exchange when one is given; declares the queue, binds its
    /// routing keys and starts consuming when a queue is given. A failure at
    /// any of these steps aborts the attempt and is returned to the caller;
    /// the first dial is never retried automatically.
    pub async fn connect(
        name: &str,
        config: Arc<BrokerConfig>,
        exchange: Option<ExchangeDefinition>,
        queue: Option<QueueDefinition>,
    ) -> Result<Arc<Client>, AmqpError> {
        let (failure_tx, failure_rx) = mpsc::channel(1);

        let client = Arc::new(Client {
            name: name.to_owned(),
            config,
            exchange,
            queue,
            handlers: HandlerRegistry::new(),
            bound_keys: Mutex::new(BTreeSet::new()),
            transport: AsyncMutex::new(Transport {
                connection: None,
                channel: None,
                pending_stream: None,
            }),
            failure_tx,
            closed: AtomicBool::new(false),
        });

        let stream = {
            let mut transport = client.transport.lock().await;
            client.establish(&mut transport, None).await?
        };

        if let Some(stream) = stream {
            tokio::spawn(dispatch::run(Arc::clone(&client), stream, failure_rx));
        }

        Ok(client)
    }

    /// Returns the client name used for registry lookup and logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once [`Client::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the routing keys currently bound on the live channel.
    pub fn bound_keys(&self) -> Vec<String> {
        self.bound_keys.lock().iter().cloned().collect()
    }

    /// Registers a handler for each of the given routing keys.
    pub fn register(&self, keys: &[String], handler: Arc<dyn DeliveryHandler>) {
        self.handlers.register(keys, handler);
    }

    pub(crate) fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    fn exchange_name(&self) -> &str {
        self.exchange
            .as_ref()
            .map(|exchange| exchange.name())
            .unwrap_or_default()
    }
}

impl Client {
    /// Binds additional routing keys onto the live queue.
    ///
    /// Keys already present in the bound set are skipped before any broker
    /// call is issued, so repeated binds are no-ops. Errors are returned to
    /// the caller without tearing the client down.
    pub async fn bind_keys(&self, keys: &[String]) -> Result<(), AmqpError> {
        let queue = match &self.queue {
            Some(queue) => queue,
            None => {
                warn!(
                    client = self.name.as_str(),
                    "bind requested on a publish-only client"
                );
                return Err(AmqpError::MissingQueueError(self.name.clone()));
            }
        };

        let transport = self.transport.lock().await;
        let channel = transport.channel.clone().ok_or(AmqpError::ChannelError)?;

        self.bind_targets(&channel, queue, keys).await
    }

    /// Dials, declares the topology, restores bindings and starts consuming.
    ///
    /// `override_keys` takes precedence over the queue's configured keys and
    /// is used by the reconnect cycle to restore the set bound before the
    /// failure. The connection gets a one-shot watcher that reports closure
    /// into the failure-signal channel.
    async fn establish(
        &self,
        transport: &mut Transport,
        override_keys: Option<&[String]>,
    ) -> Result<Option<Consumer>, AmqpError> {
        info!(
            client = self.name.as_str(),
            uri = self.config.uri(),
            "amqp connect"
        );
        let (connection, channel) = connection::open(self.config.uri(), &self.name).await?;

        if let Some(exchange) = &self.exchange {
            self.declare_exchange(&channel, exchange).await?;
        }

        let stream = match &self.queue {
            Some(queue) => Some(self.declare_queue(&channel, queue, override_keys).await?),
            None => None,
        };

        let failure_tx = self.failure_tx.clone();
        let name = self.name.clone();
        connection.on_error(move |err| {
            error!(
                client = name.as_str(),
                error = err.to_string(),
                "amqp connection failure"
            );
            let _ = failure_tx.try_send(err);
        });

        transport.connection = Some(connection);
        transport.channel = Some(channel);

        Ok(stream)
    }

    /// Declares the client's exchange on the given channel.
    async fn declare_exchange(
        &self,
        channel: &Channel,
        exchange: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        debug!(
            client = self.name.as_str(),
            "declaring exchange: {}", exchange.name
        );

        match channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exchange.durable,
                    auto_delete: exchange.delete,
                    internal: exchange.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    client = self.name.as_str(),
                    error = err.to_string(),
                    name = exchange.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(exchange.name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Declares the queue, binds the routing keys and starts consuming.
    async fn declare_queue(
        &self,
        channel: &Channel,
        queue: &QueueDefinition,
        override_keys: Option<&[String]>,
    ) -> Result<Consumer, AmqpError> {
        debug!(client = self.name.as_str(), "declaring queue: {}", queue.name);

        if let Err(err) = channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            error!(
                client = self.name.as_str(),
                error = err.to_string(),
                "error to declare the queue"
            );
            return Err(AmqpError::DeclareQueueError(queue.name.clone()));
        }

        // bindings live on the channel that declared them: start from a
        // clean set and re-record what actually gets bound
        self.bound_keys.lock().clear();

        let targets = binding_targets(override_keys, &queue.keys, &queue.consumer_tag);
        self.bind_targets(channel, queue, &targets).await?;

        debug!(
            client = self.name.as_str(),
            "starting consume for queue: {}", queue.name
        );
        match channel
            .basic_consume(
                &queue.name,
                &queue.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(stream) => Ok(stream),
            Err(err) => {
                error!(
                    client = self.name.as_str(),
                    error = err.to_string(),
                    "error to create the consumer"
                );
                Err(AmqpError::BindingConsumerError(queue.name.clone()))
            }
        }
    }

    /// Binds each key not already in the bound set.
    async fn bind_targets(
        &self,
        channel: &Channel,
        queue: &QueueDefinition,
        keys: &[String],
    ) -> Result<(), AmqpError> {
        for key in keys {
            if self.bound_keys.lock().contains(key) {
                continue;
            }

            debug!(
                client = self.name.as_str(),
                "binding queue: {} to the exchange: {} with the key: {}",
                queue.name,
                self.exchange_name(),
                key
            );

            if let Err(err) = channel
                .queue_bind(
                    &queue.name,
                    self.exchange_name(),
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                error!(
                    client = self.name.as_str(),
                    error = err.to_string(),
                    "error to bind queue to exchange"
                );
                return Err(AmqpError::BindingQueueError(key.clone(), queue.name.clone()));
            }

            self.bound_keys.lock().insert(key.clone());
        }

        Ok(())
    }
}

impl Client {
    /// Hands the dispatch loop its next delivery stream after a failure.
    ///
    /// Adopts a stream a concurrent publish already re-established, or runs
    /// the reconnect cycle itself. Returns `None` once the client has been
    /// shut down.
    pub(crate) async fn recovered_stream(&self) -> Option<Consumer> {
        let mut transport = self.transport.lock().await;

        if self.is_closed() {
            return None;
        }

        if let Some(stream) = transport.pending_stream.take() {
            return Some(stream);
        }

        let prior = self.bound_keys();
        self.reestablish(&mut transport, &prior).await
    }

    /// Reconnect cycle: teardown, fixed-interval sleep, re-dial with the
    /// prior bound keys restored. Repeats until a connection succeeds.
    async fn reestablish(&self, transport: &mut Transport, prior_keys: &[String]) -> Option<Consumer> {
        loop {
            if let Err(err) = self.teardown(transport).await {
                warn!(
                    client = self.name.as_str(),
                    error = err.to_string(),
                    "error during shutdown before reconnect"
                );
            }

            warn!(
                client = self.name.as_str(),
                wait = ?self.config.reconnect_interval,
                "amqp wait reconnect"
            );
            time::sleep(self.config.reconnect_interval).await;

            match self.establish(transport, Some(prior_keys)).await {
                Ok(stream) => {
                    info!(client = self.name.as_str(), "amqp reconnected");
                    return stream;
                }
                Err(err) => {
                    error!(
                        client = self.name.as_str(),
                        error = err.to_string(),
                        "amqp reconnect failure"
                    );
                }
            }
        }
    }

    /// Recycles the transport from the publish path, leaving any fresh
    /// delivery stream for the dispatch loop to adopt.
    async fn recover_transport(&self, transport: &mut Transport) {
        let prior = self.bound_keys();

        if let Some(stream) = self.reestablish(transport, &prior).await {
            transport.pending_stream = Some(stream);
        }
    }

    /// Gracefully discards the current channel and connection.
    ///
    /// Every step is attempted even when an earlier one fails; the first
    /// error is returned.
    async fn teardown(&self, transport: &mut Transport) -> Result<(), AmqpError> {
        transport.pending_stream = None;

        let channel = transport.channel.take();
        let connection = transport.connection.take();
        let mut result = Ok(());

        if let Some(channel) = channel {
            if let Some(queue) = &self.queue {
                if let Err(err) = channel
                    .basic_cancel(&queue.consumer_tag, BasicCancelOptions::default())
                    .await
                {
                    result = Err(AmqpError::ShutdownError(err.to_string()));
                }
            }

            if let Err(err) = channel.close(200, "client shutdown").await {
                if result.is_ok() {
                    result = Err(AmqpError::ShutdownError(err.to_string()));
                }
            }
        }

        if let Some(connection) = connection {
            if let Err(err) = connection.close(200, "client shutdown").await {
                if result.is_ok() {
                    result = Err(AmqpError::ShutdownError(err.to_string()));
                }
            }
        }

        result
    }

    /// Cancels consumption and closes the channel and the connection.
    ///
    /// The dispatch loop exits once its stream ends. Unlike the reconnect
    /// path, teardown errors are propagated to the caller.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);

        let mut transport = self.transport.lock().await;
        let result = self.teardown(&mut transport).await;

        if result.is_ok() {
            warn!(client = self.name.as_str(), "amqp shutdown ok");
        }

        result
    }
}

impl Client {
    /// Publishes a plain message to the client's exchange.
    pub async fn publish(&self, body: &[u8], routing_key: &str) -> Result<(), AmqpError> {
        self.publish_envelope(Envelope::new(), body, routing_key)
            .await
    }

    /// Publishes a message with application headers.
    pub async fn publish_with_headers(
        &self,
        body: &[u8],
        routing_key: &str,
        headers: HashMap<String, HeaderValue>,
    ) -> Result<(), AmqpError> {
        self.publish_envelope(Envelope::new().headers(headers), body, routing_key)
            .await
    }

    /// Publishes a request expecting a reply on `reply_to`, correlated by
    /// `correlation_id`.
    pub async fn publish_with_reply(
        &self,
        body: &[u8],
        routing_key: &str,
        reply_to: &str,
        correlation_id: &str,
    ) -> Result<(), AmqpError> {
        let envelope = Envelope::new()
            .reply_to(reply_to)
            .correlation_id(correlation_id);

        self.publish_envelope(envelope, body, routing_key).await
    }

    /// Publishes with a fully specified envelope.
    ///
    /// A missing channel or a failed publish recycles the transport and the
    /// identical publish is retried until it succeeds, so this call can
    /// block for the whole duration of a broker outage. Each failed cycle
    /// goes through the reconnect interval, which rate-limits retries. Only
    /// a client that was explicitly shut down fails fast.
    pub async fn publish_envelope(
        &self,
        envelope: Envelope,
        body: &[u8],
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut headers = envelope.header_table();
        otel::inject_current_context(&mut headers);
        let properties = envelope.properties(headers);

        loop {
            if self.is_closed() {
                return Err(AmqpError::ClientClosedError(self.name.clone()));
            }

            let mut transport = self.transport.lock().await;

            let channel = match &transport.channel {
                Some(channel) => channel.clone(),
                None => {
                    warn!(
                        client = self.name.as_str(),
                        "publish without a channel, recycling the connection"
                    );
                    self.recover_transport(&mut transport).await;
                    continue;
                }
            };

            match channel
                .basic_publish(
                    self.exchange_name(),
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    properties.clone(),
                )
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    error!(
                        client = self.name.as_str(),
                        error = err.to_string(),
                        "error publishing message, recycling the connection"
                    );
                    self.recover_transport(&mut transport).await;
                }
            }
        }
    }
}

/// Picks the routing keys to bind on a fresh channel, in order of
/// precedence: an explicit override (reconnect restoring the prior set), the
/// keys configured on the queue, the consumer tag as a single fallback key.
fn binding_targets(
    override_keys: Option<&[String]>,
    initial_keys: &[String],
    consumer_tag: &str,
) -> Vec<String> {
    match override_keys {
        Some(keys) if !keys.is_empty() => keys.to_vec(),
        _ if !initial_keys.is_empty() => initial_keys.to_vec(),
        _ => vec![consumer_tag.to_owned()],
    }
}
