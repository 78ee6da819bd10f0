// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handlers
//!
//! This module provides the handler capability and the per-client registry
//! that maps routing keys to handler lists. Registration is additive: a
//! second handler for the same key is appended, never replacing the first.
//! During dispatch a message is delivered to every handler in every matching
//! list, so a key can fan out to any number of callbacks.
//!
//! The sentinel key [`MATCH_ALL_KEY`] matches every routing key; registering
//! with an empty key is normalized to it.

use crate::{errors::AmqpError, message::InboundMessage};
use async_trait::async_trait;
use opentelemetry::Context;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// Routing key sentinel that matches every delivered message.
pub const MATCH_ALL_KEY: &str = "#";

/// Capability of being called with an inbound delivery.
///
/// Handler outcomes are the handler's own concern: an `Err` is logged by the
/// dispatch loop and never prevents the remaining handlers from running or
/// the message from being acknowledged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, message: &InboundMessage) -> Result<(), AmqpError>;
}

/// Mapping from routing key to an ordered list of handlers.
///
/// Safe for concurrent registration while another task iterates a snapshot
/// during dispatch.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<Arc<dyn DeliveryHandler>>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers a handler for each of the given routing keys.
    ///
    /// An empty key is normalized to [`MATCH_ALL_KEY`]. Registering the same
    /// key twice appends to that key's list.
    pub fn register(&self, keys: &[String], handler: Arc<dyn DeliveryHandler>) {
        let mut handlers = self.handlers.lock();

        for key in keys {
            let key = if key.is_empty() { MATCH_ALL_KEY } else { key };

            handlers
                .entry(key.to_owned())
                .or_default()
                .push(Arc::clone(&handler));
        }
    }

    /// Returns every handler registered for the given routing key.
    ///
    /// The result contains the exact-key list followed by the wildcard list,
    /// each in registration order, as a snapshot safe to iterate outside the
    /// lock.
    pub fn matching(&self, routing_key: &str) -> Vec<Arc<dyn DeliveryHandler>> {
        let handlers = self.handlers.lock();
        let mut matched = vec![];

        if let Some(list) = handlers.get(routing_key) {
            matched.extend(list.iter().cloned());
        }

        if routing_key != MATCH_ALL_KEY {
            if let Some(list) = handlers.get(MATCH_ALL_KEY) {
                matched.extend(list.iter().cloned());
            }
        }

        matched
    }

    /// Returns true when no handler has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<CountingHandler> {
            Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeliveryHandler for CountingHandler {
        async fn handle(&self, _ctx: &Context, _message: &InboundMessage) -> Result<(), AmqpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn exact_and_wildcard_match() {
        let registry = HandlerRegistry::new();
        registry.register(&keys(&["orders.created"]), CountingHandler::new());
        registry.register(&keys(&["#"]), CountingHandler::new());
        registry.register(&keys(&["#"]), CountingHandler::new());

        assert_eq!(registry.matching("orders.created").len(), 3);
        assert_eq!(registry.matching("orders.cancelled").len(), 2);
    }

    #[test]
    fn empty_key_normalizes_to_wildcard() {
        let registry = HandlerRegistry::new();
        registry.register(&keys(&[""]), CountingHandler::new());

        assert_eq!(registry.matching("anything.at.all").len(), 1);
        assert_eq!(registry.matching(MATCH_ALL_KEY).len(), 1);
    }

    #[test]
    fn wildcard_key_not_matched_twice() {
        let registry = HandlerRegistry::new();
        registry.register(&keys(&["#"]), CountingHandler::new());

        assert_eq!(registry.matching(MATCH_ALL_KEY).len(), 1);
    }

    #[tokio::test]
    async fn registration_appends_in_order() {
        let registry = HandlerRegistry::new();
        let first = CountingHandler::new();
        let second = CountingHandler::new();

        registry.register(&keys(&["orders.created"]), first.clone());
        registry.register(&keys(&["orders.created"]), second.clone());

        let matched = registry.matching("orders.created");
        assert_eq!(matched.len(), 2);

        // only the first snapshot entry is invoked here, proving order
        let ctx = Context::new();
        let message = InboundMessage {
            exchange: "orders".to_owned(),
            routing_key: "orders.created".to_owned(),
            body: vec![],
            headers: None,
            redelivered: false,
        };
        matched[0].handle(&ctx, &message).await.unwrap();

        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[test]
    fn concurrent_registration_is_safe() {
        let registry = Arc::new(HandlerRegistry::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry.register(&keys(&["orders.created"]), CountingHandler::new());
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(registry.matching("orders.created").len(), 400);
    }
}
