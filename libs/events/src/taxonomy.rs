//! Closed event taxonomy
//!
//! Defines every event type the platform publishes, grouped by domain, with
//! a stable wire value used as the routing key on the bus. The enumeration is
//! closed: adding an event type is a compile-time-checked change, and every
//! `match` over it is exhaustive. Publish priority is derived statically from
//! the type, never carried as free-form data.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::UnknownEventType;

/// Domain grouping for event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventGroup {
    Market,
    Portfolio,
    Risk,
    Execution,
    Analytics,
    Task,
    Alert,
}

/// Every event type known to the platform.
///
/// The wire value (`as_wire`) doubles as the topic routing key, so a
/// subscription to `EventType::OrderFilled` binds a queue with routing key
/// `execution.order_filled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventType {
    // Market
    PriceUpdate,
    MarketStatusChanged,
    // Portfolio
    PortfolioUpdated,
    PositionOpened,
    PositionClosed,
    // Risk
    RiskBreach,
    StopLossTriggered,
    RiskLimitsUpdated,
    // Execution
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    OrderRejected,
    // Analytics
    AnalysisCompleted,
    SignalGenerated,
    // Task
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    // Alert
    AlertTriggered,
}

/// Publish priority derived from the event type.
///
/// High-priority events (risk breaches, stop-loss triggers, fills, alerts)
/// overtake normal-priority messages already waiting in a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PublishPriority {
    Normal,
    High,
}

impl PublishPriority {
    /// Numeric wire value used by the broker (AMQP-style 0-10 scale).
    pub fn as_wire(&self) -> u8 {
        match self {
            PublishPriority::High => 10,
            PublishPriority::Normal => 5,
        }
    }
}

impl EventType {
    /// All event types, for iteration in tests and exhaustive tooling.
    pub const ALL: [EventType; 18] = [
        EventType::PriceUpdate,
        EventType::MarketStatusChanged,
        EventType::PortfolioUpdated,
        EventType::PositionOpened,
        EventType::PositionClosed,
        EventType::RiskBreach,
        EventType::StopLossTriggered,
        EventType::RiskLimitsUpdated,
        EventType::OrderPlaced,
        EventType::OrderFilled,
        EventType::OrderCancelled,
        EventType::OrderRejected,
        EventType::AnalysisCompleted,
        EventType::SignalGenerated,
        EventType::TaskStarted,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::AlertTriggered,
    ];

    /// Stable wire value, also used as the routing key.
    pub fn as_wire(&self) -> &'static str {
        match self {
            EventType::PriceUpdate => "market.price_update",
            EventType::MarketStatusChanged => "market.status_changed",
            EventType::PortfolioUpdated => "portfolio.updated",
            EventType::PositionOpened => "portfolio.position_opened",
            EventType::PositionClosed => "portfolio.position_closed",
            EventType::RiskBreach => "risk.breach",
            EventType::StopLossTriggered => "risk.stop_loss_triggered",
            EventType::RiskLimitsUpdated => "risk.limits_updated",
            EventType::OrderPlaced => "execution.order_placed",
            EventType::OrderFilled => "execution.order_filled",
            EventType::OrderCancelled => "execution.order_cancelled",
            EventType::OrderRejected => "execution.order_rejected",
            EventType::AnalysisCompleted => "analytics.analysis_completed",
            EventType::SignalGenerated => "analytics.signal_generated",
            EventType::TaskStarted => "task.started",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskFailed => "task.failed",
            EventType::AlertTriggered => "alert.triggered",
        }
    }

    /// Parse a wire value back into the taxonomy.
    ///
    /// Rejects anything outside the closed set, so malformed or future wire
    /// strings fail before any broker interaction.
    pub fn from_wire(s: &str) -> Result<Self, UnknownEventType> {
        for ty in EventType::ALL {
            if ty.as_wire() == s {
                return Ok(ty);
            }
        }
        Err(UnknownEventType {
            value: s.to_string(),
        })
    }

    /// Domain group of this event type.
    pub fn group(&self) -> EventGroup {
        match self {
            EventType::PriceUpdate | EventType::MarketStatusChanged => EventGroup::Market,
            EventType::PortfolioUpdated
            | EventType::PositionOpened
            | EventType::PositionClosed => EventGroup::Portfolio,
            EventType::RiskBreach
            | EventType::StopLossTriggered
            | EventType::RiskLimitsUpdated => EventGroup::Risk,
            EventType::OrderPlaced
            | EventType::OrderFilled
            | EventType::OrderCancelled
            | EventType::OrderRejected => EventGroup::Execution,
            EventType::AnalysisCompleted | EventType::SignalGenerated => EventGroup::Analytics,
            EventType::TaskStarted | EventType::TaskCompleted | EventType::TaskFailed => {
                EventGroup::Task
            }
            EventType::AlertTriggered => EventGroup::Alert,
        }
    }

    /// Static type→priority classification.
    ///
    /// Risk breaches, stop-loss triggers, fills and alerts must reach
    /// consumers ahead of routine traffic.
    pub fn priority(&self) -> PublishPriority {
        match self {
            EventType::RiskBreach
            | EventType::StopLossTriggered
            | EventType::OrderFilled
            | EventType::AlertTriggered => PublishPriority::High,
            EventType::PriceUpdate
            | EventType::MarketStatusChanged
            | EventType::PortfolioUpdated
            | EventType::PositionOpened
            | EventType::PositionClosed
            | EventType::RiskLimitsUpdated
            | EventType::OrderPlaced
            | EventType::OrderCancelled
            | EventType::OrderRejected
            | EventType::AnalysisCompleted
            | EventType::SignalGenerated
            | EventType::TaskStarted
            | EventType::TaskCompleted
            | EventType::TaskFailed => PublishPriority::Normal,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::from_wire(s)
    }
}

impl TryFrom<String> for EventType {
    type Error = UnknownEventType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EventType::from_wire(&value)
    }
}

impl From<EventType> for String {
    fn from(ty: EventType) -> Self {
        ty.as_wire().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for ty in EventType::ALL {
            assert_eq!(EventType::from_wire(ty.as_wire()).unwrap(), ty);
        }
    }

    #[test]
    fn wire_values_are_unique() {
        let mut seen = std::collections::BTreeSet::new();
        for ty in EventType::ALL {
            assert!(seen.insert(ty.as_wire()), "duplicate wire value for {ty:?}");
        }
    }

    #[test]
    fn unknown_wire_value_is_rejected() {
        let err = EventType::from_wire("market.unknown_thing").unwrap_err();
        assert_eq!(err.value, "market.unknown_thing");
    }

    #[test]
    fn critical_types_map_to_high_priority() {
        let critical = [
            EventType::RiskBreach,
            EventType::StopLossTriggered,
            EventType::OrderFilled,
            EventType::AlertTriggered,
        ];
        for ty in EventType::ALL {
            let expected = if critical.contains(&ty) {
                PublishPriority::High
            } else {
                PublishPriority::Normal
            };
            assert_eq!(ty.priority(), expected, "priority mismatch for {ty:?}");
        }
        assert_eq!(PublishPriority::High.as_wire(), 10);
        assert_eq!(PublishPriority::Normal.as_wire(), 5);
    }

    #[test]
    fn serde_uses_wire_form() {
        let json = serde_json::to_string(&EventType::OrderFilled).unwrap();
        assert_eq!(json, "\"execution.order_filled\"");
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventType::OrderFilled);
        assert!(serde_json::from_str::<EventType>("\"nope\"").is_err());
    }

    #[test]
    fn group_assignment_matches_wire_prefix() {
        for ty in EventType::ALL {
            let prefix = ty.as_wire().split('.').next().unwrap();
            let expected = match ty.group() {
                EventGroup::Market => "market",
                EventGroup::Portfolio => "portfolio",
                EventGroup::Risk => "risk",
                EventGroup::Execution => "execution",
                EventGroup::Analytics => "analytics",
                EventGroup::Task => "task",
                EventGroup::Alert => "alert",
            };
            assert_eq!(prefix, expected, "wire prefix mismatch for {ty:?}");
        }
    }
}
