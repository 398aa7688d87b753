//! Activity payload shapes and their normalization to [`EnsEvent`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::ens::{EnsEvent, EnsEventKind};

/// Order statuses that, with a `Confirmed` sub-status and full quantity,
/// prove a fill.
const FILL_STATUSES: [&str; 2] = ["Fill", "FinalFill"];

/// Order statuses that mean the order left the book without filling.
const GONE_STATUSES: [&str; 4] = ["Canceled", "Cancelled", "Rejected", "Expired"];

/// Envelope of an activity payload: a `Data` list of items.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ActivityEnvelope {
    /// The activity items, in server order.
    #[serde(default = "Vec::new")]
    pub data: Vec<ActivityItem>,
}

/// One order or position activity.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityItem {
    /// `Orders` or `Positions`.
    pub activity_type: Option<String>,
    /// Broker order id.
    pub order_id: Option<String>,
    /// Instrument.
    pub uic: Option<u64>,
    /// Broker position id.
    pub position_id: Option<String>,
    /// Order status, e.g. `Fill`, `FinalFill`, `Cancelled`.
    pub status: Option<String>,
    /// Status qualifier; fills count only when `Confirmed`.
    pub sub_status: Option<String>,
    /// Fill price.
    pub execution_price: Option<Decimal>,
    /// Fill time.
    pub execution_time: Option<DateTime<Utc>>,
    /// Base units filled so far.
    pub filled_amount: Option<Decimal>,
    /// Base units of the order or position.
    pub amount: Option<Decimal>,
    /// Position lifecycle marker, `deleted` when a position goes away.
    pub position_event: Option<String>,
}

impl ActivityItem {
    /// Normalize to an [`EnsEvent`], or `None` when the item carries nothing
    /// a workflow waits on.
    #[must_use]
    pub fn to_event(&self) -> Option<EnsEvent> {
        let uic = self.uic?;

        match self.activity_type.as_deref() {
            Some("Orders") => self.order_event(uic),
            Some("Positions") => self.position_event(uic),
            _ => None,
        }
    }

    fn order_event(&self, uic: u64) -> Option<EnsEvent> {
        let status = self.status.as_deref()?;

        if FILL_STATUSES.contains(&status) {
            if self.sub_status.as_deref() != Some("Confirmed") {
                return None;
            }

            let complete = status == "FinalFill"
                || matches!(
                    (self.filled_amount, self.amount),
                    (Some(filled), Some(amount)) if filled >= amount
                );
            if !complete {
                return None;
            }

            return Some(self.event(EnsEventKind::OrderFill, uic, status));
        }

        if GONE_STATUSES.contains(&status) {
            return Some(self.event(EnsEventKind::OrderStatusChange, uic, status));
        }

        None
    }

    fn position_event(&self, uic: u64) -> Option<EnsEvent> {
        let deleted = self
            .position_event
            .as_deref()
            .is_some_and(|event| event.eq_ignore_ascii_case("deleted"));
        let flat = self.amount.is_some_and(|amount| amount.is_zero());

        if deleted || flat {
            let status = self.status.as_deref().unwrap_or("deleted");
            return Some(self.event(EnsEventKind::PositionClosed, uic, status));
        }

        None
    }

    fn event(&self, kind: EnsEventKind, uic: u64, status: &str) -> EnsEvent {
        EnsEvent {
            kind,
            order_id: self.order_id.clone(),
            uic,
            position_id: self.position_id.clone(),
            status: status.to_lowercase(),
            execution_price: self.execution_price,
            execution_time: self.execution_time,
            filled_amount: self.filled_amount,
            amount: self.amount,
        }
    }
}
