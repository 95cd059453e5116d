//! Envelope types for the relay protocol.
//!
//! An envelope is the unit the hub routes between connected clients. It wraps
//! an opaque JSON payload with the addressing needed to decide who gets it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload field a client sets to request directed delivery.
pub const DIRECT_TO_FIELD: &str = "to_uid";

/// Who produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Submitted by a connected client.
    Client,
    /// Generated by the relay itself (errors, notices).
    Server,
}

/// A routed message.
///
/// Envelopes are immutable once built; the hub shares one instance across
/// every recipient of a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Producer of the envelope.
    pub source: Source,
    /// Identity of the originating client.
    #[serde(rename = "from_uid", default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    /// Display label of the originating client.
    #[serde(rename = "from_name", default, skip_serializing_if = "Option::is_none")]
    pub from_label: Option<String>,
    /// Single intended recipient. `None` broadcasts to everyone but the author.
    #[serde(rename = "to_uid", default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    /// Ingestion timestamp.
    pub received_at: DateTime<Utc>,
    /// Opaque payload.
    pub data: Value,
}

impl Envelope {
    /// Create a new envelope stamped with the current time.
    #[must_use]
    pub fn new(source: Source, data: Value) -> Self {
        Self {
            source,
            from_id: None,
            from_label: None,
            to_id: None,
            received_at: Utc::now(),
            data,
        }
    }

    /// Build the envelope for a payload submitted by a client.
    ///
    /// A non-empty string under [`DIRECT_TO_FIELD`] in the payload turns the
    /// envelope into a directed message. A client naming itself is treated as
    /// a broadcast, since a self-addressed envelope could reach nobody. The
    /// payload itself is kept intact.
    #[must_use]
    pub fn from_client(
        from_id: impl Into<String>,
        from_label: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        let from_id = from_id.into();
        let to_id = payload
            .get(DIRECT_TO_FIELD)
            .and_then(Value::as_str)
            .filter(|to| !to.is_empty() && *to != from_id)
            .map(str::to_owned);

        let mut envelope = Self::new(Source::Client, Value::Object(payload))
            .with_from(from_id, from_label);
        envelope.to_id = to_id;
        envelope
    }

    /// Build a server error addressed to a single client.
    #[must_use]
    pub fn server_error(to_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(message.into()));
        Self::new(Source::Server, Value::Object(data)).with_to(to_id)
    }

    /// Set the originating client.
    #[must_use]
    pub fn with_from(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.from_id = Some(id.into());
        self.from_label = Some(label.into());
        self
    }

    /// Direct the envelope at a single client.
    #[must_use]
    pub fn with_to(mut self, id: impl Into<String>) -> Self {
        self.to_id = Some(id.into());
        self
    }

    /// Whether this envelope is directed at a single client.
    #[must_use]
    pub fn is_directed(&self) -> bool {
        self.to_id.is_some()
    }

    /// Returns `true` when the envelope must not be delivered to `client_id`.
    ///
    /// Two rules apply: a client never receives its own envelopes, and a
    /// directed envelope is withheld from everyone except its addressee.
    #[must_use]
    pub fn is_excluded_for(&self, client_id: &str) -> bool {
        let own = self.from_id.as_deref() == Some(client_id);
        let addressed_elsewhere = self.to_id.as_deref().is_some_and(|to| to != client_id);
        own || addressed_elsewhere
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_broadcast_skips_author_only() {
        let env = Envelope::from_client("u1", "alice", payload(json!({"msg": "hi"})));

        assert!(!env.is_directed());
        assert!(env.is_excluded_for("u1"));
        assert!(!env.is_excluded_for("u2"));
        assert!(!env.is_excluded_for("u3"));
    }

    #[test]
    fn test_directed_reaches_addressee_only() {
        let env = Envelope::from_client("u1", "alice", payload(json!({"to_uid": "u2", "msg": "psst"})));

        assert_eq!(env.to_id.as_deref(), Some("u2"));
        assert!(!env.is_excluded_for("u2"));
        assert!(env.is_excluded_for("u1"));
        assert!(env.is_excluded_for("u3"));
    }

    #[test]
    fn test_empty_or_non_string_target_is_broadcast() {
        let empty = Envelope::from_client("u1", "alice", payload(json!({"to_uid": ""})));
        assert!(!empty.is_directed());

        let numeric = Envelope::from_client("u1", "alice", payload(json!({"to_uid": 7})));
        assert!(!numeric.is_directed());
    }

    #[test]
    fn test_self_addressed_payload_is_broadcast() {
        let env = Envelope::from_client("u1", "alice", payload(json!({"to_uid": "u1", "n": 1})));

        assert!(!env.is_directed());
        assert!(env.is_excluded_for("u1"));
        assert!(!env.is_excluded_for("u2"));
        assert_eq!(env.data["to_uid"], "u1");
    }

    #[test]
    fn test_server_error_shape() {
        let env = Envelope::server_error("u9", "Invalid data");

        assert_eq!(env.source, Source::Server);
        assert!(env.from_id.is_none());
        assert_eq!(env.data, json!({"error": "Invalid data"}));
        assert!(!env.is_excluded_for("u9"));
        assert!(env.is_excluded_for("u1"));
    }

    #[test]
    fn test_json_field_names() {
        let env = Envelope::from_client("u1", "alice", payload(json!({"msg": "hi"})));
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["source"], "client");
        assert_eq!(value["from_uid"], "u1");
        assert_eq!(value["from_name"], "alice");
        assert!(value.get("to_uid").is_none());
        assert_eq!(value["data"], json!({"msg": "hi"}));
        assert!(value["received_at"].is_string());
    }
}
