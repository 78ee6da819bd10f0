// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatch Loop
//!
//! One dedicated task per consuming client. Each inbound message is routed
//! to every handler registered for its routing key and to every wildcard
//! handler, then acknowledged exactly once. Handler failures are logged and
//! never affect the remaining handlers or the acknowledgment.
//!
//! When the delivery stream closes or the failure-signal channel fires, the
//! loop asks the client for a replacement stream, blocking for as many
//! reconnect cycles as it takes, and resumes with the same handler
//! registry.

use crate::{client::Client, errors::AmqpError, handler::HandlerRegistry, message::InboundMessage, otel};
use futures_util::StreamExt;
use lapin::{message::Delivery, options::BasicAckOptions, Consumer};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Long-running dispatch task for one client.
pub(crate) async fn run(
    client: Arc<Client>,
    mut stream: Consumer,
    mut failures: mpsc::Receiver<lapin::Error>,
) {
    info!(client = client.name(), "dispatch loop started");

    loop {
        let interrupted = tokio::select! {
            delivery = stream.next() => match delivery {
                Some(Ok(delivery)) => {
                    if let Err(err) = deliver(&client, delivery).await {
                        error!(
                            client = client.name(),
                            error = err.to_string(),
                            "error consume msg"
                        );
                    }
                    false
                }
                Some(Err(err)) => {
                    error!(
                        client = client.name(),
                        error = err.to_string(),
                        "error reading delivery"
                    );
                    false
                }
                None => true,
            },
            failure = failures.recv() => {
                if let Some(err) = failure {
                    error!(
                        client = client.name(),
                        error = err.to_string(),
                        "delivery stream lost"
                    );
                }
                true
            }
        };

        if interrupted {
            match client.recovered_stream().await {
                Some(next) => {
                    stream = next;
                    info!(client = client.name(), "dispatch loop resumed");
                }
                None => break,
            }
        }
    }

    info!(client = client.name(), "dispatch loop stopped");
}

/// Routes one delivery to all matching handlers, then acks it.
async fn deliver(client: &Client, delivery: Delivery) -> Result<(), AmqpError> {
    let message = InboundMessage::from(&delivery);

    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::consumer_span(&delivery.properties, &tracer, &message.routing_key);

    debug!(
        client = client.name(),
        key = message.routing_key.as_str(),
        exchange = message.exchange.as_str(),
        "received delivery"
    );

    fan_out(client.handlers(), &ctx, &message).await;

    match delivery.ack(BasicAckOptions::default()).await {
        Err(err) => {
            error!(client = client.name(), "error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(AmqpError::AckMessageError)
        }
        _ => {
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}

/// Invokes every handler whose key matches the message's routing key.
///
/// Handlers never short-circuit each other: a failure is logged and the
/// remaining handlers still run.
pub(crate) async fn fan_out(handlers: &HandlerRegistry, ctx: &Context, message: &InboundMessage) {
    for handler in handlers.matching(&message.routing_key) {
        if let Err(err) = handler.handle(ctx, message).await {
            error!(
                key = message.routing_key.as_str(),
                error = err.to_string(),
                "handler failure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DeliveryHandler, MockDeliveryHandler, MATCH_ALL_KEY};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeliveryHandler for CountingHandler {
        async fn handle(&self, _ctx: &Context, _message: &InboundMessage) -> Result<(), AmqpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl DeliveryHandler for FailingHandler {
        async fn handle(&self, _ctx: &Context, _message: &InboundMessage) -> Result<(), AmqpError> {
            Err(AmqpError::ConsumerError("boom".to_owned()))
        }
    }

    fn message(routing_key: &str) -> InboundMessage {
        InboundMessage {
            exchange: "orders".to_owned(),
            routing_key: routing_key.to_owned(),
            body: br#"{"id":"42"}"#.to_vec(),
            headers: None,
            redelivered: false,
        }
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn two_wildcard_and_one_exact_handler_fan_out_to_three_calls() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register(
            &keys(&[MATCH_ALL_KEY]),
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );
        registry.register(
            &keys(&[MATCH_ALL_KEY]),
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );
        registry.register(
            &keys(&["orders.created"]),
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );

        fan_out(&registry, &Context::new(), &message("orders.created")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unmatched_key_invokes_nothing() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register(
            &keys(&["orders.created"]),
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );

        fan_out(&registry, &Context::new(), &message("orders.cancelled")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_failure_does_not_stop_the_others() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register(&keys(&["orders.created"]), Arc::new(FailingHandler));
        registry.register(
            &keys(&["orders.created"]),
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );

        fan_out(&registry, &Context::new(), &message("orders.created")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mocked_handler_sees_the_message_once() {
        let mut mock = MockDeliveryHandler::new();
        mock.expect_handle()
            .times(1)
            .returning(|_, message| {
                assert_eq!(message.routing_key, "orders.created");
                assert_eq!(message.body, br#"{"id":"42"}"#);
                Ok(())
            });

        let registry = HandlerRegistry::new();
        registry.register(&keys(&["orders.created"]), Arc::new(mock));

        fan_out(&registry, &Context::new(), &message("orders.created")).await;
    }
}
