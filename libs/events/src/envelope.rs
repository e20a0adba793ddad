//! The event envelope
//!
//! An `Event` is constructed by the producer, serialized once at publish
//! time, and independently deserialized by every subscriber. No shared
//! mutable instance ever crosses the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BusError;
use crate::ids::{CorrelationId, EventId};
use crate::taxonomy::{EventType, PublishPriority};

/// Envelope carried for every event on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier, immutable after construction.
    pub id: EventId,
    /// Member of the closed taxonomy; serialized as its wire value.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Arbitrary structured payload.
    pub data: Value,
    /// Producer identity, e.g. `"risk-engine"`.
    pub source: String,
    /// UTC creation time.
    pub timestamp: DateTime<Utc>,
    /// Propagates through causally related events.
    pub correlation_id: CorrelationId,
}

impl Event {
    /// Build an event starting a fresh causal chain.
    pub fn new(event_type: EventType, data: Value, source: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            data,
            source: source.into(),
            timestamp: Utc::now(),
            correlation_id: CorrelationId::new(),
        }
    }

    /// Build an event continuing an existing causal chain.
    pub fn with_correlation(
        event_type: EventType,
        data: Value,
        source: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            correlation_id,
            ..Self::new(event_type, data, source)
        }
    }

    /// Publish priority derived statically from the type.
    pub fn priority(&self) -> PublishPriority {
        self.event_type.priority()
    }

    /// Routing key under which this event is published.
    pub fn routing_key(&self) -> &'static str {
        self.event_type.as_wire()
    }

    /// Serialize for the wire. Each subscriber decodes its own copy.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire payload. An unknown event type or malformed body is a
    /// `BusError::Deserialization`; such messages are dropped, never requeued.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn new_event_mints_fresh_ids() {
        let a = Event::new(EventType::PriceUpdate, json!({"symbol": "BTC/USDT"}), "md");
        let b = Event::new(EventType::PriceUpdate, json!({"symbol": "BTC/USDT"}), "md");
        assert_ne!(a.id, b.id);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn correlation_propagates() {
        let root = Event::new(EventType::OrderPlaced, json!({"order": 1}), "execution");
        let child = Event::with_correlation(
            EventType::OrderFilled,
            json!({"order": 1, "fill": 1}),
            "execution",
            root.correlation_id,
        );
        assert_eq!(child.correlation_id, root.correlation_id);
        assert_ne!(child.id, root.id);
    }

    #[test]
    fn round_trip_preserves_identity_fields() {
        let event = Event::new(
            EventType::RiskBreach,
            json!({"limit": "max_drawdown", "value": 0.31}),
            "risk-engine",
        );
        let bytes = event.to_bytes().unwrap();
        let back = Event::from_bytes(&bytes).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.data, event.data);
        assert_eq!(back.source, event.source);
        assert_eq!(back.correlation_id, event.correlation_id);
    }

    #[test]
    fn unknown_wire_type_fails_decoding() {
        let mut raw = serde_json::to_value(Event::new(
            EventType::TaskStarted,
            json!({}),
            "scheduler",
        ))
        .unwrap();
        raw["type"] = json!("task.reticulated");
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(matches!(
            Event::from_bytes(&bytes),
            Err(BusError::Deserialization(_))
        ));
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_payloads(
            key in "[a-z_]{1,12}",
            text in ".*",
            num in any::<i64>(),
            flag in any::<bool>(),
        ) {
            let mut payload = serde_json::Map::new();
            payload.insert(key, json!(text));
            payload.insert("n".to_string(), json!(num));
            payload.insert("flag".to_string(), json!(flag));
            let event = Event::new(
                EventType::SignalGenerated,
                Value::Object(payload),
                "analytics",
            );
            let back = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(back.id, event.id);
            prop_assert_eq!(back.data, event.data);
            prop_assert_eq!(back.source, event.source);
            prop_assert_eq!(back.correlation_id, event.correlation_id);
        }
    }
}
