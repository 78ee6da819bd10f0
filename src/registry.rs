// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Registry
//!
//! Process-wide sharing of broker connections by logical name. The registry
//! is an explicit object constructed once from a [`BrokerConfig`] and passed
//! to callers, not ambient global state. Repeated requests for the same name
//! reuse the live client: new routing keys are layered onto it through the
//! idempotent bind, and additional handlers are appended, all without
//! opening a second connection.

use crate::{
    client::Client, config::BrokerConfig, errors::AmqpError, exchange::ExchangeDefinition,
    handler::DeliveryHandler, queue::QueueDefinition,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Concurrency-safe table mapping a logical client name to its live client.
pub struct ClientRegistry {
    config: Arc<BrokerConfig>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientRegistry {
    /// Creates a registry for the given broker configuration.
    pub fn new(config: BrokerConfig) -> ClientRegistry {
        ClientRegistry {
            config: Arc::new(config),
            clients: Mutex::new(HashMap::default()),
        }
    }

    /// Returns the configuration this registry creates clients from.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Returns the live client for `name`, creating it on first request.
    ///
    /// Without a queue descriptor the created client is publish-only. When
    /// the name is already registered and a queue descriptor with routing
    /// keys is given, those keys are bound onto the existing client instead
    /// of opening a new connection; a bind failure is returned to the caller
    /// and the existing client stays registered. A handler, when given, is
    /// registered for the queue's keys (or the wildcard when there are
    /// none).
    pub async fn get_or_create(
        &self,
        name: &str,
        exchange: Option<ExchangeDefinition>,
        queue: Option<QueueDefinition>,
        handler: Option<Arc<dyn DeliveryHandler>>,
    ) -> Result<Arc<Client>, AmqpError> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(name) {
            let client = Arc::clone(client);
            debug!(client = name, "reusing registered amqp client");

            match &queue {
                Some(queue) => {
                    let keys = handler_keys(queue);
                    client.bind_keys(&keys).await?;

                    if let Some(handler) = handler {
                        client.register(&keys, handler);
                    }
                }
                None => {
                    if let Some(handler) = handler {
                        client.register(&[String::new()], handler);
                    }
                }
            }

            return Ok(client);
        }

        let client = Client::connect(name, Arc::clone(&self.config), exchange, queue.clone()).await?;
        info!(client = name, "amqp client created");

        if let Some(handler) = handler {
            let keys = queue
                .as_ref()
                .map(handler_keys)
                .unwrap_or_else(|| vec![String::new()]);
            client.register(&keys, handler);
        }

        clients.insert(name.to_owned(), Arc::clone(&client));

        Ok(client)
    }
}

/// Keys a handler passed alongside this queue should listen on: the queue's
/// configured keys, or its consumer tag when no key is configured.
fn handler_keys(queue: &QueueDefinition) -> Vec<String> {
    if queue.keys.is_empty() {
        vec![queue.consumer_tag.clone()]
    } else {
        queue.keys.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_keys_prefer_configured_keys() {
        let queue = QueueDefinition::new("orders.worker")
            .key("orders.created")
            .key("orders.cancelled");

        assert_eq!(
            handler_keys(&queue),
            vec!["orders.created", "orders.cancelled"]
        );
    }

    #[test]
    fn handler_keys_fall_back_to_consumer_tag() {
        let queue = QueueDefinition::new("orders.worker");

        assert_eq!(handler_keys(&queue), vec!["orders.worker"]);
    }

    #[test]
    fn registry_exposes_its_config() {
        let registry = ClientRegistry::new(BrokerConfig::new("amqp://broker:5672/%2f"));

        assert_eq!(registry.config().uri(), "amqp://broker:5672/%2f");
    }
}
