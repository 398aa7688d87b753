//! The Event Notification Service subsystem: the broker's streaming push
//! channel for order and position activity, plus the machinery to keep it
//! alive.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

pub mod client;
pub mod data;
pub mod frame;

/// Kind of a normalized stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsEventKind {
    /// An order filled completely.
    OrderFill,
    /// An order left the book without filling (canceled, rejected, expired).
    OrderStatusChange,
    /// A position went away.
    PositionClosed,
}

/// Normalized form of one stream activity, the currency of the
/// [`crate::waiters::WaiterRegistry`].
#[derive(Debug, Clone)]
pub struct EnsEvent {
    /// What happened.
    pub kind: EnsEventKind,
    /// Order the activity belongs to, where applicable.
    pub order_id: Option<String>,
    /// Instrument.
    pub uic: u64,
    /// Position the activity belongs to, where applicable.
    pub position_id: Option<String>,
    /// Broker status, lowercased.
    pub status: String,
    /// Fill price, for fills.
    pub execution_price: Option<Decimal>,
    /// Fill time, for fills.
    pub execution_time: Option<DateTime<Utc>>,
    /// Base units filled.
    pub filled_amount: Option<Decimal>,
    /// Base units requested.
    pub amount: Option<Decimal>,
}

/// Payload reasons that force a reconnect.
const CONTROL_REASONS: [&str; 3] = [
    "SubscriptionPermanentlyDisabled",
    "SessionLimitExceeded",
    "SubscriptionDisabled",
];

/// Payload message types that force a reconnect.
const CONTROL_MESSAGE_TYPES: [&str; 3] = ["disconnect", "reset", "reset-subscriptions"];

/// Classification of one stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadClass {
    /// Server instruction to rebuild the connection; carries the trigger.
    Control(String),
    /// Order/position activity to normalize and dispatch.
    Activity,
}

/// Classify one payload: control when it carries a known `Reason` or
/// `MessageType`, activity otherwise.
#[must_use]
pub fn classify_payload(payload: &serde_json::Value) -> PayloadClass {
    if let Some(reason) = payload.get("Reason").and_then(serde_json::Value::as_str) {
        if CONTROL_REASONS.contains(&reason) {
            return PayloadClass::Control(reason.to_owned());
        }
    }

    if let Some(kind) = payload
        .get("MessageType")
        .and_then(serde_json::Value::as_str)
    {
        if CONTROL_MESSAGE_TYPES.contains(&kind) {
            return PayloadClass::Control(kind.to_owned());
        }
    }

    PayloadClass::Activity
}
