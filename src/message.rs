// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Representations
//!
//! This module provides the two message shapes crossing the client boundary:
//! the [`InboundMessage`] view handed to delivery handlers, and the outbound
//! [`Envelope`] describing everything about a publish besides the body and
//! the routing key. Bodies are opaque byte sequences; the client never
//! interprets payload content.

use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties,
};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Default content type for outbound messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Inbound message view handed to delivery handlers.
///
/// The acknowledgment capability stays with the dispatch loop: handlers only
/// observe the message, and the loop acks exactly once after every matching
/// handler has run.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Option<FieldTable>,
    pub redelivered: bool,
}

impl From<&Delivery> for InboundMessage {
    fn from(delivery: &Delivery) -> InboundMessage {
        InboundMessage {
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            body: delivery.data.clone(),
            headers: delivery.properties.headers().clone(),
            redelivered: delivery.redelivered,
        }
    }
}

/// Typed header values accepted on outbound messages.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    UInt(u32),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> HeaderValue {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> HeaderValue {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> HeaderValue {
        HeaderValue::UInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> HeaderValue {
        HeaderValue::Bool(value)
    }
}

/// Everything about an outbound publish besides body and routing key.
///
/// Constructed fresh per publish call and not retained. The reply-to and
/// correlation-id fields support request/reply flows where the caller
/// declares a temporary queue and expects an answer on it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub(crate) content_type: String,
    pub(crate) headers: Option<HashMap<String, HeaderValue>>,
    pub(crate) reply_to: Option<String>,
    pub(crate) correlation_id: Option<String>,
}

impl Default for Envelope {
    fn default() -> Envelope {
        Envelope {
            content_type: TEXT_CONTENT_TYPE.to_owned(),
            headers: None,
            reply_to: None,
            correlation_id: None,
        }
    }
}

impl Envelope {
    /// Creates a plain-text envelope with no headers.
    pub fn new() -> Envelope {
        Envelope::default()
    }

    /// Sets the content type.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    /// Sets the content type to JSON.
    pub fn json(mut self) -> Self {
        self.content_type = JSON_CONTENT_TYPE.to_owned();
        self
    }

    /// Replaces the header map.
    pub fn headers(mut self, headers: HashMap<String, HeaderValue>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Adds a single header.
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers
            .get_or_insert_with(HashMap::default)
            .insert(key.to_owned(), value);
        self
    }

    /// Sets the queue name a reply is expected on.
    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    /// Sets the correlation id identifying the request being answered.
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    /// Converts the typed header map into AMQP header values.
    ///
    /// The result still needs trace-context injection before it is attached
    /// to the published properties.
    pub(crate) fn header_table(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        if let Some(headers) = &self.headers {
            for (key, value) in headers {
                let amqp_value = match value {
                    HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
                    HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
                    HeaderValue::UInt(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
                    HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
                };

                btree.insert(ShortString::from(key.clone()), amqp_value);
            }
        }

        btree
    }

    /// Builds the AMQP properties for one publish attempt.
    pub(crate) fn properties(&self, headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(reply_to) = &self.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
        }

        if let Some(correlation_id) = &self.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
        }

        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_defaults_to_plain_text() {
        let envelope = Envelope::new();

        assert_eq!(envelope.content_type, TEXT_CONTENT_TYPE);
        assert!(envelope.headers.is_none());
        assert!(envelope.reply_to.is_none());
        assert!(envelope.correlation_id.is_none());
    }

    #[test]
    fn header_table_converts_typed_values() {
        let envelope = Envelope::new()
            .header("origin", HeaderValue::from("billing"))
            .header("attempt", HeaderValue::from(3i64))
            .header("limit", HeaderValue::from(10u32))
            .header("urgent", HeaderValue::from(true));

        let table = envelope.header_table();

        assert_eq!(
            table.get(&ShortString::from("origin")),
            Some(&AMQPValue::LongString(LongString::from("billing")))
        );
        assert_eq!(
            table.get(&ShortString::from("attempt")),
            Some(&AMQPValue::LongLongInt(3))
        );
        assert_eq!(
            table.get(&ShortString::from("limit")),
            Some(&AMQPValue::LongUInt(10))
        );
        assert_eq!(
            table.get(&ShortString::from("urgent")),
            Some(&AMQPValue::Boolean(true))
        );
    }

    #[test]
    fn properties_carry_reply_fields() {
        let envelope = Envelope::new()
            .json()
            .reply_to("rpc.replies")
            .correlation_id("req-42");

        let properties = envelope.properties(envelope.header_table());

        assert_eq!(
            properties.content_type(),
            &Some(ShortString::from(JSON_CONTENT_TYPE))
        );
        assert_eq!(
            properties.reply_to(),
            &Some(ShortString::from("rpc.replies"))
        );
        assert_eq!(
            properties.correlation_id(),
            &Some(ShortString::from("req-42"))
        );
        assert!(properties.message_id().is_some());
    }
}
