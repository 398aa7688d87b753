//! The trade plan entry and its lifecycle states.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Long the base currency.
    Buy,
    /// Short the base currency.
    Sell,
}

impl Side {
    /// The opposing direction, used when closing a position.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for Buy, -1 for Sell, as a decimal multiplier.
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }

    /// The wire name the broker expects (`Buy` / `Sell`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

/// Why a trade was skipped without submitting anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The scheduled moment was already past when the trade came up.
    TimePast,
    /// Instrument lookup produced no UIC for the pair.
    UicMissing,
    /// Quoted spread exceeded the configured ceiling.
    Spread,
    /// A position or working order already existed on the instrument.
    Existing,
    /// A pre-execution token ping failed.
    PreCheckFailed,
    /// Today's weekday is not in the trade's allowed set.
    Weekday,
}

/// Why an entry submission ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryFailReason {
    /// The broker returned an order error.
    OrderError,
    /// The submission deadline after the scheduled moment was exceeded.
    TimeExceeded,
    /// The outcome could not be established; trading halts.
    Unknown,
    /// Submitted, but no fill arrived over the stream or the audit route.
    Unconfirmed,
}

/// Why an exit ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitFailReason {
    /// The broker returned an order error.
    OrderError,
    /// The close was submitted but never confirmed, even via audit.
    Unconfirmed,
}

/// State machine of a single plan entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    /// Not yet acted on.
    Pending,
    /// Entry order sent, fill not yet confirmed.
    EntrySubmitted,
    /// Entry fill confirmed, holding.
    Entered,
    /// Close order sent, fill not yet confirmed.
    ExitSubmitted,
    /// Flat, exit price known.
    Closed,
    /// Flat, but the exit price could not be established.
    ClosedPriceUnknown,
    /// The position was already gone at exit time.
    ClosedPreClosed,
    /// Never submitted.
    Skipped(SkipReason),
    /// Entry failed.
    EntryFailed(EntryFailReason),
    /// Exit failed.
    ExitFailed(ExitFailReason),
}

impl TradeStatus {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeStatus::Closed
                | TradeStatus::ClosedPriceUnknown
                | TradeStatus::ClosedPreClosed
                | TradeStatus::Skipped(_)
                | TradeStatus::EntryFailed(_)
                | TradeStatus::ExitFailed(_)
        )
    }
}

impl core::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TradeStatus::Pending => write!(f, "pending"),
            TradeStatus::EntrySubmitted => write!(f, "entry-submitted"),
            TradeStatus::Entered => write!(f, "entered"),
            TradeStatus::ExitSubmitted => write!(f, "exit-submitted"),
            TradeStatus::Closed => write!(f, "closed"),
            TradeStatus::ClosedPriceUnknown => write!(f, "closed (price-unknown)"),
            TradeStatus::ClosedPreClosed => write!(f, "closed (pre-closed)"),
            TradeStatus::Skipped(reason) => {
                let reason = match reason {
                    SkipReason::TimePast => "time-past",
                    SkipReason::UicMissing => "uic-missing",
                    SkipReason::Spread => "spread",
                    SkipReason::Existing => "existing",
                    SkipReason::PreCheckFailed => "pre-check-failed",
                    SkipReason::Weekday => "weekday",
                };
                write!(f, "skipped ({reason})")
            }
            TradeStatus::EntryFailed(reason) => {
                let reason = match reason {
                    EntryFailReason::OrderError => "order-error",
                    EntryFailReason::TimeExceeded => "time-exceeded",
                    EntryFailReason::Unknown => "unknown",
                    EntryFailReason::Unconfirmed => "unconfirmed",
                };
                write!(f, "entry-failed ({reason})")
            }
            TradeStatus::ExitFailed(reason) => {
                let reason = match reason {
                    ExitFailReason::OrderError => "order-error",
                    ExitFailReason::Unconfirmed => "unconfirmed",
                };
                write!(f, "exit-failed ({reason})")
            }
        }
    }
}

/// Which leg of a trade an order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderLeg {
    /// The opening market order.
    Entry,
    /// The closing market order.
    Exit,
}

impl OrderLeg {
    fn as_str(self) -> &'static str {
        match self {
            OrderLeg::Entry => "entry",
            OrderLeg::Exit => "exit",
        }
    }
}

/// One plan entry: what to trade, when to enter, when to exit, plus the
/// runtime fields the lifecycle fills in as it advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Plan-unique identifier.
    pub id: u32,
    /// Currency pair, e.g. `EUR/USD`.
    pub pair: String,
    /// Direction of the entry.
    pub side: Side,
    /// Lot size; one lot is 10,000 base units.
    #[serde(with = "rust_decimal::serde::str")]
    pub lot_size: Decimal,
    /// Scheduled entry moment, wall clock in the configured timezone.
    pub entry_time: NaiveTime,
    /// Scheduled exit moment, wall clock in the configured timezone.
    pub exit_time: NaiveTime,
    /// When set, the trade only runs on these weekdays.
    #[serde(default)]
    pub allowed_weekdays: Option<Vec<Weekday>>,
    /// Broker instrument code, resolved before scheduling.
    #[serde(default)]
    pub uic: Option<u64>,
    /// Broker asset type of the instrument.
    #[serde(default = "default_asset_type")]
    pub asset_type: String,
    /// Price precision of the instrument.
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    /// Lifecycle state.
    #[serde(default = "default_status")]
    pub status: TradeStatus,
    /// Broker order id of the entry, once submitted.
    #[serde(default)]
    pub entry_order_id: Option<String>,
    /// Broker order id of the close, once submitted.
    #[serde(default)]
    pub exit_order_id: Option<String>,
    /// Broker position id, once the entry fill is confirmed.
    #[serde(default)]
    pub position_id: Option<String>,
    /// Confirmed entry execution price.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub entry_fill_price: Option<Decimal>,
    /// Confirmed exit execution price.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub exit_fill_price: Option<Decimal>,
    /// Base units actually filled at entry.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub entry_filled_amount: Option<Decimal>,
    /// Actual entry execution time.
    #[serde(default)]
    pub entry_timestamp_actual: Option<DateTime<Utc>>,
    /// Actual exit execution time.
    #[serde(default)]
    pub exit_timestamp_actual: Option<DateTime<Utc>>,
    /// Realized profit in pips, once closed.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub pips_profit: Option<Decimal>,
}

fn default_asset_type() -> String {
    "FxSpot".to_owned()
}

fn default_decimals() -> u32 {
    5
}

fn default_status() -> TradeStatus {
    TradeStatus::Pending
}

impl Trade {
    /// A fresh plan entry with runtime fields at their initial values.
    #[must_use]
    pub fn new(
        id: u32,
        pair: impl Into<String>,
        side: Side,
        lot_size: Decimal,
        entry_time: NaiveTime,
        exit_time: NaiveTime,
    ) -> Self {
        Self {
            id,
            pair: pair.into(),
            side,
            lot_size,
            entry_time,
            exit_time,
            allowed_weekdays: None,
            uic: None,
            asset_type: default_asset_type(),
            decimals: default_decimals(),
            status: TradeStatus::Pending,
            entry_order_id: None,
            exit_order_id: None,
            position_id: None,
            entry_fill_price: None,
            exit_fill_price: None,
            entry_filled_amount: None,
            entry_timestamp_actual: None,
            exit_timestamp_actual: None,
            pips_profit: None,
        }
    }

    /// Order amount in base currency units (`lot_size` × 10,000, truncated).
    #[must_use]
    pub fn amount(&self) -> Decimal {
        (self.lot_size * dec!(10000)).trunc()
    }

    /// Smallest conventional price increment for this pair.
    #[must_use]
    pub fn pip_value(&self) -> Decimal {
        pip_value_for_pair(&self.pair)
    }

    /// The idempotency tag attached to an order for the given leg on the
    /// given trading day: `{YYYYMMDD}_trade_{id}_{entry|exit}_v1`.
    #[must_use]
    pub fn external_reference(&self, date: NaiveDate, leg: OrderLeg) -> String {
        format!(
            "{}_trade_{}_{}_v1",
            date.format("%Y%m%d"),
            self.id,
            leg.as_str()
        )
    }

    /// Compute and store the realized pips once both fills are known.
    pub fn settle_pips(&mut self) {
        if let (Some(entry), Some(exit)) = (self.entry_fill_price, self.exit_fill_price) {
            self.pips_profit = Some(pips_profit(entry, exit, self.side, self.pip_value()));
        }
    }
}

/// Pip size by quote currency: 0.01 for JPY-quoted pairs, 0.0001 otherwise.
#[must_use]
pub fn pip_value_for_pair(pair: &str) -> Decimal {
    if pair.trim_end().ends_with("JPY") {
        dec!(0.01)
    } else {
        dec!(0.0001)
    }
}

/// Signed profit in pips, rounded half-up to 0.1.
#[must_use]
pub fn pips_profit(entry: Decimal, exit: Decimal, side: Side, pip_value: Decimal) -> Decimal {
    ((exit - entry) * side.sign() / pip_value)
        .round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero)
}

/// Half-up rounding of a price to the instrument's decimals, used for the
/// displaced bracket prices.
#[must_use]
pub fn round_price(price: Decimal, decimals: u32) -> Decimal {
    price.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}
