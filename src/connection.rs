// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Setup
//!
//! Dialing the broker and opening the single channel every client
//! communicates over. One connection carries exactly one channel; the
//! reconnect cycle discards and re-creates both together.

use crate::errors::AmqpError;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use tracing::{debug, error};

/// Dials the broker at the given URI and opens one channel.
///
/// The client name is attached as the AMQP connection name so the broker
/// management UI can tell clients apart.
pub(crate) async fn open(uri: &str, name: &str) -> Result<(Connection, Channel), AmqpError> {
    debug!(client = name, "creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

    let connection = match Connection::connect(uri, options).await {
        Ok(c) => c,
        Err(err) => {
            error!(client = name, error = err.to_string(), "failure to connect");
            return Err(AmqpError::ConnectionError);
        }
    };
    debug!(client = name, "amqp connected");

    debug!(client = name, "creating amqp channel...");
    match connection.create_channel().await {
        Ok(channel) => {
            debug!(client = name, "channel created");
            Ok((connection, channel))
        }
        Err(err) => {
            error!(
                client = name,
                error = err.to_string(),
                "error to create the channel"
            );
            Err(AmqpError::ChannelError)
        }
    }
}
