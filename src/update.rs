// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Cross-Service Update Notifications
//!
//! One concrete payload this client transports: the JSON envelope services
//! publish to a well-known direct exchange whenever "something changed", and
//! consume through the generic handler mechanism. The client carries the
//! envelope as an opaque body and never interprets it.
//!
//! [`send_update`] publishes through a shared publish-only client;
//! [`on_updates`] sets up a consumer with a generated auto-delete queue
//! bound to the caller's routing keys.

use crate::{
    client::Client, errors::AmqpError, exchange::ExchangeDefinition, handler::DeliveryHandler,
    message::Envelope, queue::QueueDefinition, registry::ClientRegistry,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// Registry name of the shared update publisher client
pub const UPDATE_SENDER: &str = "update-sender";
/// Registry name of the shared update listener client
pub const UPDATE_LISTENER: &str = "update-listener";

/// Prefix of generated update-listener queue names
const UPDATE_QUEUE_PREFIX: &str = "updates";

/// Envelope for a "something changed" event exchanged between services.
///
/// `data` carries the changed object pre-encoded as JSON; `ext_data` is free
/// structured metadata. The wire names are camelCase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Update {
    pub id: String,
    pub ext_id: String,
    pub cmd: String,
    pub collection: String,
    pub data: String,
    pub groups: Vec<String>,
    pub ext_data: serde_json::Value,
    pub recipients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
}

/// Optional delivery targeting for an update.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub recipients: Vec<String>,
    pub initiator: Option<String>,
}

fn update_exchange(registry: &ClientRegistry) -> ExchangeDefinition {
    ExchangeDefinition::new(&registry.config().update_exchange).durable()
}

/// Publishes an update notification for one object of `collection`.
///
/// The object is JSON-encoded into the envelope's `data` field and the
/// envelope is published with the collection as routing key, through a
/// publish-only client shared across all senders in the process.
pub async fn send_update<T: Serialize>(
    registry: &ClientRegistry,
    collection: &str,
    id: &str,
    cmd: &str,
    data: &T,
    options: UpdateOptions,
) -> Result<(), AmqpError> {
    let object_json = serde_json::to_string(data).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize update data");
        AmqpError::SerializePayloadError
    })?;

    let update = Update {
        id: id.to_owned(),
        cmd: cmd.to_owned(),
        collection: collection.to_owned(),
        data: object_json,
        recipients: options.recipients,
        initiator: options.initiator,
        ..Update::default()
    };

    let body = serde_json::to_vec(&update).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize update");
        AmqpError::SerializePayloadError
    })?;

    let client = registry
        .get_or_create(UPDATE_SENDER, Some(update_exchange(registry)), None, None)
        .await?;

    client
        .publish_envelope(Envelope::new().json(), &body, collection)
        .await
}

/// Subscribes to update notifications for the given routing keys.
///
/// Creates (or reuses) the process-wide listener client: a generated
/// auto-delete queue on the update exchange, bound to `keys`, with `handler`
/// registered for them. Additional calls layer more keys and handlers onto
/// the same connection.
pub async fn on_updates(
    registry: &ClientRegistry,
    keys: &[String],
    handler: Arc<dyn DeliveryHandler>,
) -> Result<Arc<Client>, AmqpError> {
    let queue_name = registry.config().generated_name(UPDATE_QUEUE_PREFIX);
    let queue = QueueDefinition::new(&queue_name)
        .delete()
        .keys(keys.to_vec());

    registry
        .get_or_create(
            UPDATE_LISTENER,
            Some(update_exchange(registry)),
            Some(queue),
            Some(handler),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_serializes_with_camel_case_names() {
        let update = Update {
            id: "42".to_owned(),
            ext_id: "ext-42".to_owned(),
            cmd: "update".to_owned(),
            collection: "orders".to_owned(),
            data: r#"{"id":"42"}"#.to_owned(),
            groups: vec!["fleet".to_owned()],
            ext_data: json!({"reason": "price"}),
            recipients: vec!["billing".to_owned()],
            initiator: Some("admin".to_owned()),
        };

        let value = serde_json::to_value(&update).unwrap();

        assert_eq!(value["extId"], "ext-42");
        assert_eq!(value["extData"]["reason"], "price");
        assert_eq!(value["recipients"][0], "billing");
        assert_eq!(value["initiator"], "admin");
    }

    #[test]
    fn absent_initiator_is_omitted() {
        let update = Update {
            id: "42".to_owned(),
            cmd: "delete".to_owned(),
            collection: "orders".to_owned(),
            ..Update::default()
        };

        let value = serde_json::to_value(&update).unwrap();

        assert!(value.get("initiator").is_none());
        assert_eq!(value["extData"], serde_json::Value::Null);
    }

    #[test]
    fn update_roundtrip() {
        let update = Update {
            id: "42".to_owned(),
            cmd: "update".to_owned(),
            collection: "orders".to_owned(),
            data: r#"{"id":"42"}"#.to_owned(),
            ..Update::default()
        };

        let encoded = serde_json::to_vec(&update).unwrap();
        let decoded: Update = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded, update);
    }

    #[test]
    fn decodes_envelope_without_initiator() {
        let raw = r#"{
            "id": "42",
            "extId": "",
            "cmd": "update",
            "collection": "orders",
            "data": "{\"id\":\"42\"}",
            "groups": [],
            "extData": null,
            "recipients": []
        }"#;

        let decoded: Update = serde_json::from_str(raw).unwrap();

        assert_eq!(decoded.id, "42");
        assert_eq!(decoded.cmd, "update");
        assert!(decoded.initiator.is_none());
    }
}
