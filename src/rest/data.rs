//! Serde shapes for the REST routes the engine consumes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Response of the OAuth token endpoint, for both the authorization-code and
/// the refresh-token grants.
#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    /// Bearer token for REST and streaming authorization.
    pub access_token: String,
    /// Token used to mint the next access token.
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: Option<u64>,
    /// Refresh token lifetime in seconds.
    pub refresh_token_expires_in: Option<u64>,
    /// Always `Bearer`.
    pub token_type: Option<String>,
}

/// `GET /port/v1/clients/me`, used as the cheap token-validity probe.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ClientInfo {
    /// Key addressing the client across portfolio routes.
    pub client_key: String,
    /// Key of the client's default account.
    pub default_account_key: Option<String>,
    /// Display name.
    pub name: Option<String>,
}

/// Envelope every list route wraps its items in.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ListEnvelope<T> {
    /// The items.
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

/// One account from `GET /port/v1/accounts/me`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Account {
    /// Key addressing the account on order and position routes.
    pub account_key: String,
    /// Key of the owning client.
    pub client_key: String,
    /// `Normal`, `Cash`, …
    pub account_type: Option<String>,
    /// Account currency.
    pub currency: Option<String>,
    /// Asset types the account may trade.
    #[serde(default = "Vec::new")]
    pub legal_asset_types: Vec<String>,
}

impl Account {
    /// Whether this account can carry FX spot positions (first such non-cash
    /// account is selected at session bootstrap).
    #[must_use]
    pub fn supports_fx_spot(&self) -> bool {
        self.legal_asset_types.iter().any(|t| t == "FxSpot")
            && self.account_type.as_deref() != Some("Cash")
    }
}

/// `GET /port/v1/balances`.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct Balance {
    /// Free cash.
    pub cash_balance: Decimal,
    /// Account currency.
    pub currency: String,
    /// Total account value including unrealized positions.
    pub total_value: Option<Decimal>,
}

/// One instrument from `GET /ref/v1/instruments`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct InstrumentSummary {
    /// The UIC.
    pub identifier: u64,
    /// `FxSpot` for everything this engine trades.
    pub asset_type: String,
    /// Broker symbol, e.g. `EURUSD`.
    pub symbol: Option<String>,
    /// Human description.
    pub description: Option<String>,
}

/// Quote block of an info price.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Quote {
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Mid price.
    pub mid: Option<Decimal>,
}

/// Display block of an info price, source of the instrument's decimals.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DisplayAndFormat {
    /// Price precision.
    pub decimals: Option<u32>,
}

/// One item of `GET /trade/v1/infoprices/list`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct InfoPrice {
    /// The UIC.
    pub uic: u64,
    /// Quote, present when the instrument is streaming prices.
    pub quote: Option<Quote>,
    /// Display metadata.
    pub display_and_format: Option<DisplayAndFormat>,
}

/// Normalized two-sided price the engine works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceInfo {
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Instrument price precision.
    pub decimals: u32,
}

impl PriceInfo {
    /// Ask minus bid.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// Spread expressed in pips of the given pip size.
    #[must_use]
    pub fn spread_pips(&self, pip_value: Decimal) -> Decimal {
        self.spread() / pip_value
    }
}

/// Duration block of a related order.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct OrderDuration {
    /// `GoodTillCancel` for bracket legs, `DayOrder` otherwise.
    pub duration_type: String,
}

/// One attached bracket leg of an order request: a Stop for the stop-loss, a
/// Limit for the take-profit.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct RelatedOrderRequest {
    /// `Stop` or `Limit`.
    pub order_type: String,
    /// Trigger/limit price, already rounded to the instrument decimals.
    #[serde(with = "rust_decimal::serde::float")]
    pub order_price: Decimal,
    /// Direction, always opposite the entry.
    pub buy_sell: String,
    /// Base units.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// Duration of the leg.
    pub order_duration: OrderDuration,
}

/// Body of `POST /trade/v2/orders`.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct OrderRequest {
    /// Account placing the order.
    pub account_key: String,
    /// Instrument.
    pub uic: u64,
    /// `FxSpot`.
    pub asset_type: String,
    /// Base units.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// `Buy` or `Sell`.
    pub buy_sell: String,
    /// `Market`.
    pub order_type: String,
    /// Duration of the order.
    pub order_duration: OrderDuration,
    /// Client-side idempotency tag.
    pub external_reference: String,
    /// Marks a human-initiated order for regulatory reporting.
    pub manual_order: bool,
    /// Attached bracket legs, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<Vec<RelatedOrderRequest>>,
    /// `ToClose` when offsetting an existing position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_open_close: Option<String>,
    /// Position being offset, for `ToClose` orders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
}

/// Error block a 2xx order response may carry instead of an order id.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorInfo {
    /// Machine code.
    pub error_code: Option<String>,
    /// Human message.
    pub message: Option<String>,
}

impl core::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.error_code.as_deref().unwrap_or("unknown"),
            self.message.as_deref().unwrap_or("no message")
        )
    }
}

/// Reference to one placed order inside an order response.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct PlacedOrder {
    /// Broker order id.
    pub order_id: Option<String>,
}

/// Response of `POST /trade/v2/orders`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct OrderResponse {
    /// Id of the principal order.
    pub order_id: Option<String>,
    /// Ids of the attached bracket legs, in request order.
    #[serde(default = "Vec::new")]
    pub orders: Vec<PlacedOrder>,
    /// Present when the request parsed but the order was refused.
    pub error_info: Option<ErrorInfo>,
}

/// One working order from `GET /port/v1/orders`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct WorkingOrder {
    /// Broker order id.
    pub order_id: String,
    /// Instrument.
    pub uic: u64,
    /// `Working`, `Placed`, `Queued`, …
    pub status: Option<String>,
    /// Direction.
    pub buy_sell: Option<String>,
    /// Base units.
    pub amount: Option<Decimal>,
    /// `Market`, `Stop`, `Limit`, …
    pub open_order_type: Option<String>,
    /// Client idempotency tag the order was placed with.
    pub external_reference: Option<String>,
}

impl WorkingOrder {
    /// Whether the order still occupies the book.
    #[must_use]
    pub fn is_working(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("Working" | "Placed" | "Queued")
        )
    }
}

/// Static block of a position.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct PositionBase {
    /// Instrument.
    pub uic: u64,
    /// Signed base units; negative for short.
    pub amount: Decimal,
    /// Fill price the position was opened at.
    pub open_price: Option<Decimal>,
    /// Whether an offsetting order may reference it.
    pub can_be_closed: Option<bool>,
}

/// Market-dependent block of a position.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct PositionView {
    /// Current price used for valuation.
    pub current_price: Option<Decimal>,
}

/// One position from `GET /port/v1/positions`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Position {
    /// Broker position id.
    pub position_id: String,
    /// Static fields.
    pub position_base: PositionBase,
    /// Valuation fields.
    pub position_view: Option<PositionView>,
}

/// One row of `GET /cs/v1/audit/orderactivities`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct OrderActivity {
    /// Broker order id.
    pub order_id: Option<String>,
    /// `Fill`, `FinalFill`, `Working`, …
    pub status: Option<String>,
    /// Qualifier of the status.
    pub sub_status: Option<String>,
    /// Volume-weighted fill price.
    pub average_price: Option<Decimal>,
    /// Base units filled so far.
    pub filled_amount: Option<Decimal>,
    /// Base units requested.
    pub amount: Option<Decimal>,
    /// When the activity was recorded.
    pub activity_time: Option<DateTime<Utc>>,
    /// Position the fill opened or grew.
    pub position_id: Option<String>,
}

impl OrderActivity {
    /// Whether this row proves the order filled: a `Fill`/`FinalFill` status
    /// with a usable average price.
    #[must_use]
    pub fn is_fill(&self) -> bool {
        matches!(self.status.as_deref(), Some("Fill" | "FinalFill")) && self.average_price.is_some()
    }
}

/// Body of `POST /ens/v1/activities/subscriptions`.
#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionRequest {
    /// Client-chosen streaming context.
    pub context_id: String,
    /// Client-chosen id of this subscription within the context.
    pub reference_id: String,
    /// Activity filter.
    pub arguments: SubscriptionArguments,
}

/// Arguments block of a subscription request.
#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionArguments {
    /// `["Orders", "Positions"]`.
    pub activities: Vec<String>,
    /// Account scope.
    pub account_key: String,
    /// Client scope.
    pub client_key: String,
}

/// Response of `POST /ens/v1/activities/subscriptions`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct EnsSubscription {
    /// Context the subscription lives in.
    pub context_id: String,
    /// Id used to address (and delete) the subscription.
    pub reference_id: String,
    /// `Active` on success.
    pub state: Option<String>,
    /// Server-side inactivity timeout in seconds.
    pub inactivity_timeout: Option<u64>,
}

/// Result of probing for an order by its external reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundOrder {
    /// Broker order id.
    pub order_id: String,
    /// Status at probe time.
    pub status: Option<String>,
}
