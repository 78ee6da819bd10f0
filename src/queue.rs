// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Descriptors
//!
//! This module provides the immutable specification of a RabbitMQ queue: its
//! declaration flags, the consumer tag used when consumption starts, and the
//! initial list of routing keys to bind. The set of keys actually bound on
//! the live channel is tracked by the owning client and grows monotonically;
//! this definition only seeds it.

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue
/// definitions. The consumer tag defaults to the queue name; when no routing
/// keys are configured at all, the consumer tag doubles as the single bound
/// key.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) consumer_tag: String,
    pub(crate) keys: Vec<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue is non-durable and non-exclusive, and the
    /// consumer tag equals the queue name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            consumer_tag: name.to_owned(),
            keys: vec![],
        }
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Overrides the consumer tag used when consumption starts.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    /// Sets the initial routing keys to bind.
    pub fn keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    /// Adds a single routing key to bind.
    pub fn key(mut self, key: &str) -> Self {
        self.keys.push(key.to_owned());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let def = QueueDefinition::new("orders.worker");

        assert_eq!(def.name(), "orders.worker");
        assert_eq!(def.consumer_tag, "orders.worker");
        assert!(!def.durable);
        assert!(!def.delete);
        assert!(!def.exclusive);
        assert!(def.keys.is_empty());
    }

    #[test]
    fn builder_chaining() {
        let def = QueueDefinition::new("orders.worker")
            .durable()
            .delete()
            .exclusive()
            .consumer_tag("worker-1")
            .key("orders.created")
            .key("orders.cancelled");

        assert!(def.durable);
        assert!(def.delete);
        assert!(def.exclusive);
        assert_eq!(def.consumer_tag, "worker-1");
        assert_eq!(def.keys, vec!["orders.created", "orders.cancelled"]);
    }
}
