//! Crate config module.

use std::path::PathBuf;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// The config of the engine, this is passed often through the system.
///
/// Every duration is in seconds. Defaults mirror the operational settings the
/// engine ships with; URL and credential fields have no defaults and must be
/// provided before [`crate::engine::Engine`] can authenticate.
#[derive(Debug, Clone)]
pub struct Config {
    /// Run against the LIVE environment instead of SIM.
    pub use_live: bool,
    /// OAuth application client id.
    pub client_id: Option<String>,
    /// OAuth application client secret.
    pub client_secret: Option<String>,
    /// Redirect URI registered with the OAuth application.
    pub redirect_uri: Option<url::Url>,
    /// OAuth authorization endpoint (`/authorize`).
    pub authorize_url: Option<url::Url>,
    /// OAuth token endpoint (`/token`).
    pub token_url: Option<url::Url>,
    /// REST gateway base, e.g. `https://gateway.../openapi`.
    pub rest_url: Option<url::Url>,
    /// Streaming gateway base, e.g. `wss://streaming.../openapi/streamingws`.
    pub streaming_url: Option<url::Url>,
    /// Wall-clock timezone all plan times are interpreted in.
    pub timezone: chrono_tz::Tz,
    /// Stop-loss distance in pips for bracket orders.
    pub stop_loss_pips: Decimal,
    /// Take-profit distance in pips for bracket orders.
    pub take_profit_pips: Decimal,
    /// Reject an entry whose quoted spread exceeds this many pips.
    pub spread_pips_limit: Decimal,
    /// Attach stop-loss/take-profit bracket orders to entries.
    pub brackets_enabled: bool,
    /// Extra entry submission attempts after the first.
    pub entry_retry_count: u32,
    /// Extra exit submission attempts after the first.
    pub exit_retry_count: u32,
    /// Upper bound of the randomized advance before a scheduled moment.
    pub random_delay_sec: u64,
    /// How long a fill waiter blocks before the audit fallback runs.
    pub fill_timeout_seconds: u64,
    /// Transport-level websocket ping interval.
    pub ws_ping_interval: u64,
    /// Timeout for a single websocket ping round trip.
    pub ws_ping_timeout: u64,
    /// Timeout for the websocket close handshake.
    pub ws_close_timeout: u64,
    /// Seconds without any stream message before the connection is declared stale.
    pub ens_stale_seconds: u64,
    /// Liveness monitor wake interval.
    pub ens_monitor_interval_seconds: u64,
    /// Silence thresholds that each emit one notification per disconnect episode.
    pub ens_notify_thresholds: Vec<u64>,
    /// Reconnect backoff ceiling.
    pub ens_reconnect_max_delay_seconds: u64,
    /// Period of the access-token refresh task.
    pub token_refresh_interval_seconds: u64,
    /// Re-authorize the streaming context after each token refresh.
    pub streaming_authorize_enabled: bool,
    /// Path of the crash-recovery state file.
    pub state_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_live: false,
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            authorize_url: None,
            token_url: None,
            rest_url: None,
            streaming_url: None,
            timezone: chrono_tz::Asia::Tokyo,
            stop_loss_pips: dec!(1.0),
            take_profit_pips: dec!(4000.0),
            spread_pips_limit: dec!(3.5),
            brackets_enabled: true,
            entry_retry_count: 0,
            exit_retry_count: 3,
            random_delay_sec: 3,
            fill_timeout_seconds: 180,
            ws_ping_interval: 15,
            ws_ping_timeout: 5,
            ws_close_timeout: 5,
            ens_stale_seconds: 45,
            ens_monitor_interval_seconds: 10,
            ens_notify_thresholds: vec![10, 60, 180],
            ens_reconnect_max_delay_seconds: 30,
            token_refresh_interval_seconds: 1080,
            streaming_authorize_enabled: true,
            state_file: PathBuf::from("trade_status.json"),
        }
    }
}
