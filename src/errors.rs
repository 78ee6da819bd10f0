// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Client
//!
//! This module provides the error set for broker operations. The `AmqpError`
//! enum covers connection and channel setup, topology declaration, key
//! binding, consumption, publishing and shutdown scenarios.
//!
//! Setup errors are returned synchronously to the caller that creates a
//! client. Transport failures observed after creation are absorbed by the
//! reconnect cycle and only logged.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a routing key to a queue
    #[error("failure to bind key `{0}` to queue `{1}`")]
    BindingQueueError(String, String),

    /// Error starting consumption on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Binding was requested on a publish-only client
    #[error("client `{0}` has no queue to bind")]
    MissingQueueError(String),

    /// The client was explicitly shut down
    #[error("client `{0}` is shut down")]
    ClientClosedError(String),

    /// Error inside a delivery handler
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error during graceful teardown of a channel or connection
    #[error("failure to shutdown `{0}`")]
    ShutdownError(String),
}
