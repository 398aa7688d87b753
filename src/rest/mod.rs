//! The REST broker client: session state, the retry ladder every call goes
//! through, and the portfolio/reference routes. Order routes live in
//! [`crate::rest::orders`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use url::Url;

use crate::config::Config;
use crate::error::EngineError;
use crate::rest::auth::{
    build_authorize_url, AuthorizationCodeProvider, CodeGrant, PkceChallenge, RefreshGrant,
};
use crate::rest::data::{
    Account, Balance, ClientInfo, EnsSubscription, FoundOrder, InfoPrice, InstrumentSummary,
    ListEnvelope, OrderActivity, Position, PriceInfo, SubscriptionArguments, SubscriptionRequest,
    TokenResponse, WorkingOrder,
};

pub mod auth;
pub mod data;
pub mod orders;

/// Attempts for calls on the default retry ladder.
const MAX_ATTEMPTS: u32 = 3;
/// Waits after a failed refresh attempt.
const REFRESH_BACKOFF: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(10)];
/// Read timeout for price snapshots; quotes are useless late.
const PRICE_READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for the cheap token-validity probe.
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);
/// A refresh completing within this window satisfies concurrent callers.
const REFRESH_COALESCE_WINDOW: i64 = 30;
/// Audit poll schedule: up to 3 looks, 5 seconds apart.
const AUDIT_POLLS: u32 = 3;
const AUDIT_POLL_WAIT: Duration = Duration::from_secs(5);

/// How a call behaves when the broker or the network misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryPolicy {
    /// Idempotent call: full ladder (3 attempts, backoff, Retry-After).
    Safe,
    /// Order submission: never resent; an unusable outcome surfaces as
    /// `Ok(None)` so the caller can probe by external reference.
    OrderSubmit,
    /// Price snapshot: one attempt with a short read timeout.
    PriceOnce,
}

/// Everything the process knows about its broker session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Current bearer token.
    pub access_token: Option<String>,
    /// Token used to mint the next access token.
    pub refresh_token: Option<String>,
    /// When the access token was issued.
    pub token_issued_at: Option<DateTime<Utc>>,
    /// Key of the trading account.
    pub account_key: Option<String>,
    /// Key of the owning client.
    pub client_key: Option<String>,
    /// Streaming context the ENS subscription lives in. Generated fresh per
    /// subscription and stable across token refreshes.
    pub streaming_context_id: Option<String>,
    /// Reference id of the active ENS subscription.
    pub ens_subscription_id: Option<String>,
}

/// The REST client owning the token pair and account identifiers.
#[derive(Debug)]
pub struct BrokerClient {
    http: reqwest::Client,
    config: Config,
    session: Mutex<Session>,
    provider: Arc<dyn AuthorizationCodeProvider>,
    /// Memoized TP/SL order ids per UIC, so exits can retire them.
    tp_sl_order_ids_by_uic: Mutex<HashMap<u64, Vec<String>>>,
    /// Cleared when the stream-authorize route 404s (feature probe).
    streaming_authorize_supported: AtomicBool,
}

impl BrokerClient {
    /// A client over the given config and authorization-code provider.
    #[must_use]
    pub fn new(config: Config, provider: Arc<dyn AuthorizationCodeProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            session: Mutex::new(Session::default()),
            provider,
            tp_sl_order_ids_by_uic: Mutex::new(HashMap::new()),
            streaming_authorize_supported: AtomicBool::new(true),
        }
    }

    /// The config the client was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A copy of the current session state.
    pub async fn session(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// The current access token, if any.
    pub async fn access_token(&self) -> Option<String> {
        self.session.lock().await.access_token.clone()
    }

    /// Store a streaming context and subscription reference on the session.
    pub async fn set_streaming_context(&self, context_id: String, subscription_id: String) {
        let mut session = self.session.lock().await;
        session.streaming_context_id = Some(context_id);
        session.ens_subscription_id = Some(subscription_id);
    }

    /// Seed tokens recovered from an earlier process, before `authenticate`.
    pub async fn seed_tokens(&self, access_token: String, refresh_token: String) {
        let mut session = self.session.lock().await;
        session.access_token = Some(access_token);
        session.refresh_token = Some(refresh_token);
        session.token_issued_at = Some(Utc::now());
    }

    fn rest_endpoint(&self, path: &str) -> Result<Url, EngineError> {
        let Some(ref base) = self.config.rest_url else {
            return Err(EngineError::ConfigMissing("rest_url".to_owned()));
        };

        base.join(path)
            .map_err(|err| EngineError::Http(err.to_string()))
    }

    async fn bearer(&self) -> Result<String, EngineError> {
        self.session
            .lock()
            .await
            .access_token
            .clone()
            .ok_or_else(|| EngineError::AuthFailed("no access token on session".to_owned()))
    }

    async fn keys(&self) -> Result<(String, String), EngineError> {
        let session = self.session.lock().await;
        match (session.account_key.clone(), session.client_key.clone()) {
            (Some(account_key), Some(client_key)) => Ok((account_key, client_key)),
            _ => Err(EngineError::AuthFailed(
                "account keys not loaded; authenticate first".to_owned(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Request core
    // ------------------------------------------------------------------

    /// One REST call through the retry ladder.
    ///
    /// `Ok(None)` means "nothing usable came back without it being an error":
    /// a 404/405, an empty body, or — under [`RetryPolicy::OrderSubmit`] — an
    /// ambiguous transport failure the caller must resolve by probing.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
        policy: RetryPolicy,
    ) -> Result<Option<T>, EngineError> {
        let max_attempts = match policy {
            RetryPolicy::Safe => MAX_ATTEMPTS,
            RetryPolicy::OrderSubmit | RetryPolicy::PriceOnce => 1,
        };
        let mut attempt = 0;
        let mut auth_steps = 0;
        let mut rate_waits = 0;

        loop {
            attempt += 1;

            let token = self.bearer().await?;
            let mut request = self.http.request(method.clone(), url.clone()).bearer_auth(&token);
            if let Some(ref json) = body {
                request = request.json(json);
            }
            if policy == RetryPolicy::PriceOnce {
                request = request.timeout(PRICE_READ_TIMEOUT);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("{method} {url} transport failure: {err}");

                    match policy {
                        RetryPolicy::OrderSubmit => return Ok(None),
                        RetryPolicy::PriceOnce => return Err(EngineError::Http(err.to_string())),
                        RetryPolicy::Safe => {
                            if attempt >= max_attempts {
                                return Err(EngineError::Http(err.to_string()));
                            }
                            tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                            continue;
                        }
                    }
                }
            };

            let status = response.status();

            if status.as_u16() == 401 {
                if auth_steps >= 2 {
                    return Err(EngineError::Unauthorized);
                }
                if auth_steps == 0 && self.refresh_access_token().await.is_ok() {
                    auth_steps = 1;
                } else {
                    // authenticate() returns a boxed future to break the
                    // async type cycle: it reaches back into this function
                    // for account loading.
                    self.authenticate().await?;
                    auth_steps = 2;
                }
                continue;
            }

            if status.as_u16() == 429 {
                let wait = retry_after(&response);
                if policy == RetryPolicy::Safe && rate_waits < MAX_ATTEMPTS {
                    rate_waits += 1;
                    log::warn!("{method} {url} rate limited, waiting {wait:?}");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                return Err(EngineError::Status {
                    status: 429,
                    body: String::new(),
                });
            }

            if status.is_server_error() {
                match policy {
                    RetryPolicy::OrderSubmit => return Ok(None),
                    RetryPolicy::PriceOnce | RetryPolicy::Safe if attempt >= max_attempts => {
                        return Err(EngineError::Status {
                            status: status.as_u16(),
                            body: response.text().await.unwrap_or_default(),
                        });
                    }
                    RetryPolicy::Safe | RetryPolicy::PriceOnce => {
                        tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                        continue;
                    }
                }
            }

            if matches!(status.as_u16(), 404 | 405) {
                return Ok(None);
            }

            if !status.is_success() {
                return Err(EngineError::Status {
                    status: status.as_u16(),
                    body: response.text().await.unwrap_or_default(),
                });
            }

            let text = response
                .text()
                .await
                .map_err(|err| EngineError::Http(err.to_string()))?;
            if text.trim().is_empty() {
                return Ok(None);
            }

            return match serde_json::from_str::<T>(&text) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    log::error!("{method} {url} returned undecodable body: {err}");
                    Err(EngineError::SerdeJson)
                }
            };
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, EngineError> {
        self.call(Method::GET, url, None, RetryPolicy::Safe).await
    }

    // ------------------------------------------------------------------
    // Authentication & session keeping
    // ------------------------------------------------------------------

    /// Establish a working session: reuse the current access token when the
    /// broker still accepts it, otherwise run the full authorization-code +
    /// PKCE flow, then load account keys.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the OAuth flow fails or no FX-capable account
    /// exists on the client.
    pub fn authenticate(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + '_>>
    {
        Box::pin(async move {
            let have_token = self.session.lock().await.access_token.is_some();

            if have_token && self.validate_token().await {
                log::debug!("existing access token accepted");
            } else {
                self.full_authorize().await?;
            }

            self.load_account_keys().await?;

            match self.fetch_balance().await {
                Ok(Some(balance)) => {
                    log::info!(
                        "session ready, balance {} {}",
                        balance.cash_balance,
                        balance.currency
                    );
                }
                Ok(None) => log::warn!("balance route returned nothing"),
                Err(err) => log::warn!("balance fetch failed: {err}"),
            }

            Ok(())
        })
    }

    /// Whether the broker currently accepts the access token.
    pub async fn validate_token(&self) -> bool {
        let Ok(url) = self.rest_endpoint("port/v1/clients/me") else {
            return false;
        };
        let Ok(token) = self.bearer().await else {
            return false;
        };

        match self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(VALIDATE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                log::warn!("token validation probe failed: {err}");
                false
            }
        }
    }

    async fn full_authorize(&self) -> Result<(), EngineError> {
        let client_id = self.require_config_str(self.config.client_id.as_deref(), "client_id")?;
        let redirect_uri = self
            .config
            .redirect_uri
            .clone()
            .ok_or_else(|| EngineError::ConfigMissing("redirect_uri".to_owned()))?;
        let authorize_base = self
            .config
            .authorize_url
            .clone()
            .ok_or_else(|| EngineError::ConfigMissing("authorize_url".to_owned()))?;

        let pkce = PkceChallenge::generate();
        let authorize_url = build_authorize_url(&authorize_base, &client_id, &redirect_uri, &pkce);

        log::info!("running authorization-code flow");

        let provider = Arc::clone(&self.provider);
        let code = tokio::task::spawn_blocking(move || provider.obtain_code(&authorize_url))
            .await
            .map_err(|err| EngineError::AuthFailed(err.to_string()))??;

        let grant = CodeGrant {
            grant_type: "authorization_code",
            code: &code,
            redirect_uri: redirect_uri.as_str(),
            code_verifier: &pkce.verifier,
        };
        let tokens = self.token_request(&grant).await?;
        self.store_tokens(tokens).await;

        Ok(())
    }

    /// Refresh the access token, up to 3 attempts with linear backoff.
    ///
    /// The session lock is held for the whole exchange, so refreshes are
    /// mutually exclusive and a caller arriving during one blocks until it
    /// finishes; a refresh completed moments ago satisfies the caller
    /// without another round trip. The streaming context id survives.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::RefreshRejected`] if the token endpoint
    /// answers 401 — the refresh token is dead and only a full re-authorize
    /// can recover the session.
    pub async fn refresh_access_token(&self) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;

        if let Some(issued_at) = session.token_issued_at {
            if (Utc::now() - issued_at).num_seconds() < REFRESH_COALESCE_WINDOW {
                log::debug!("token refreshed {issued_at}, coalescing");
                return Ok(());
            }
        }

        let refresh_token = session
            .refresh_token
            .clone()
            .ok_or_else(|| EngineError::AuthFailed("no refresh token on session".to_owned()))?;

        let mut last_err = EngineError::Unhandled;
        for attempt in 0..MAX_ATTEMPTS {
            let grant = RefreshGrant {
                grant_type: "refresh_token",
                refresh_token: &refresh_token,
            };

            match self.token_request(&grant).await {
                Ok(tokens) => {
                    session.access_token = Some(tokens.access_token);
                    session.refresh_token = Some(tokens.refresh_token);
                    session.token_issued_at = Some(Utc::now());
                    log::debug!("access token refreshed");
                    return Ok(());
                }
                Err(EngineError::RefreshRejected) => return Err(EngineError::RefreshRejected),
                Err(err) => {
                    log::warn!("token refresh attempt {} failed: {err}", attempt + 1);
                    last_err = err;
                    if let Some(wait) = REFRESH_BACKOFF.get(attempt as usize) {
                        tokio::time::sleep(*wait).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// One exchange against the token endpoint with HTTP Basic client auth.
    async fn token_request<G: serde::Serialize>(
        &self,
        grant: &G,
    ) -> Result<TokenResponse, EngineError> {
        let token_url = self
            .config
            .token_url
            .clone()
            .ok_or_else(|| EngineError::ConfigMissing("token_url".to_owned()))?;
        let client_id = self.require_config_str(self.config.client_id.as_deref(), "client_id")?;
        let client_secret =
            self.require_config_str(self.config.client_secret.as_deref(), "client_secret")?;

        let response = self
            .http
            .post(token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(grant)
            .send()
            .await
            .map_err(|err| EngineError::Http(err.to_string()))?;

        if response.status().as_u16() == 401 {
            return Err(EngineError::RefreshRejected);
        }
        if !response.status().is_success() {
            return Err(EngineError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| EngineError::AuthFailed(err.to_string()))
    }

    async fn store_tokens(&self, tokens: TokenResponse) {
        let mut session = self.session.lock().await;
        session.access_token = Some(tokens.access_token);
        session.refresh_token = Some(tokens.refresh_token);
        session.token_issued_at = Some(Utc::now());
    }

    async fn load_account_keys(&self) -> Result<(), EngineError> {
        let url = self.rest_endpoint("port/v1/clients/me")?;
        let client: ClientInfo = self
            .get(url)
            .await?
            .ok_or_else(|| EngineError::AuthFailed("clients/me returned nothing".to_owned()))?;

        let url = self.rest_endpoint("port/v1/accounts/me")?;
        let accounts: ListEnvelope<Account> = self
            .get(url)
            .await?
            .ok_or_else(|| EngineError::AuthFailed("accounts/me returned nothing".to_owned()))?;

        let account = accounts
            .data
            .iter()
            .find(|account| account.supports_fx_spot())
            .ok_or_else(|| {
                EngineError::AuthFailed("no FxSpot-capable non-cash account".to_owned())
            })?;

        let mut session = self.session.lock().await;
        session.account_key = Some(account.account_key.clone());
        session.client_key = Some(account.client_key.clone());
        drop(session);

        let suffix: String = client.client_key.chars().rev().take(4).collect();
        log::info!(
            "selected account {}… (client …{})",
            &account.account_key[..account.account_key.len().min(6)],
            suffix.chars().rev().collect::<String>()
        );

        Ok(())
    }

    fn require_config_str(
        &self,
        value: Option<&str>,
        name: &str,
    ) -> Result<String, EngineError> {
        value
            .map(str::to_owned)
            .ok_or_else(|| EngineError::ConfigMissing(name.to_owned()))
    }

    // ------------------------------------------------------------------
    // Portfolio & reference routes
    // ------------------------------------------------------------------

    /// Cash balance of the trading account.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the retry ladder exhausts.
    pub async fn fetch_balance(&self) -> Result<Option<Balance>, EngineError> {
        let (account_key, client_key) = self.keys().await?;
        let mut url = self.rest_endpoint("port/v1/balances")?;
        url.query_pairs_mut()
            .append_pair("AccountKey", &account_key)
            .append_pair("ClientKey", &client_key);

        self.get(url).await
    }

    /// Resolve a currency pair like `EUR/USD` to its instrument record.
    ///
    /// Prefers an exact symbol match (`EURUSD`); falls back to the first
    /// result the keyword search returns.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the retry ladder exhausts.
    pub async fn resolve_instrument(
        &self,
        pair: &str,
    ) -> Result<Option<InstrumentSummary>, EngineError> {
        let (account_key, _) = self.keys().await?;
        let mut url = self.rest_endpoint("ref/v1/instruments")?;
        url.query_pairs_mut()
            .append_pair("AssetTypes", "FxSpot")
            .append_pair("Keywords", pair)
            .append_pair("AccountKey", &account_key)
            .append_pair("IncludeNonTradable", "false");

        let Some(listing): Option<ListEnvelope<InstrumentSummary>> = self.get(url).await? else {
            return Ok(None);
        };

        let symbol = pair.replace('/', "");
        let exact = listing
            .data
            .iter()
            .find(|instrument| instrument.symbol.as_deref() == Some(symbol.as_str()))
            .cloned();

        Ok(exact.or_else(|| listing.data.into_iter().next()))
    }

    /// Snapshot bid/ask/decimals for a set of UICs in one call. Single
    /// attempt with a short read timeout; a stale quote is worse than none.
    ///
    /// # Errors
    ///
    /// Will return `Err` on any transport or decode failure.
    pub async fn fetch_price_infos(
        &self,
        uics: &[u64],
    ) -> Result<HashMap<u64, PriceInfo>, EngineError> {
        let (account_key, _) = self.keys().await?;
        let uics_csv = uics
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut url = self.rest_endpoint("trade/v1/infoprices/list")?;
        url.query_pairs_mut()
            .append_pair("AccountKey", &account_key)
            .append_pair("Uics", &uics_csv)
            .append_pair("AssetType", "FxSpot")
            .append_pair("FieldGroups", "Quote,DisplayAndFormat,PriceInfo");

        let listing: Option<ListEnvelope<InfoPrice>> = self
            .call(Method::GET, url, None, RetryPolicy::PriceOnce)
            .await?;

        let mut prices = HashMap::new();
        for info in listing.map(|l| l.data).unwrap_or_default() {
            let Some(quote) = info.quote else { continue };
            let (Some(bid), Some(ask)) = (quote.bid, quote.ask) else {
                continue;
            };
            let decimals = info
                .display_and_format
                .and_then(|format| format.decimals)
                .unwrap_or(5);

            prices.insert(info.uic, PriceInfo { bid, ask, decimals });
        }

        Ok(prices)
    }

    /// Working orders (`Working`/`Placed`/`Queued`), optionally scoped to one
    /// instrument.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the retry ladder exhausts.
    pub async fn list_working_orders(
        &self,
        uic: Option<u64>,
    ) -> Result<Vec<WorkingOrder>, EngineError> {
        let (account_key, client_key) = self.keys().await?;
        let mut url = self.rest_endpoint("port/v1/orders")?;
        url.query_pairs_mut()
            .append_pair("AccountKey", &account_key)
            .append_pair("ClientKey", &client_key)
            .append_pair("$top", "100");
        if let Some(uic) = uic {
            url.query_pairs_mut().append_pair("Uics", &uic.to_string());
        }

        let listing: Option<ListEnvelope<WorkingOrder>> = self.get(url).await?;

        Ok(listing
            .map(|l| l.data)
            .unwrap_or_default()
            .into_iter()
            .filter(WorkingOrder::is_working)
            .collect())
    }

    /// Open positions, optionally scoped to one instrument.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the retry ladder exhausts.
    pub async fn list_positions(&self, uic: Option<u64>) -> Result<Vec<Position>, EngineError> {
        let (account_key, client_key) = self.keys().await?;
        let mut url = self.rest_endpoint("port/v1/positions")?;
        url.query_pairs_mut()
            .append_pair("AccountKey", &account_key)
            .append_pair("ClientKey", &client_key)
            .append_pair("FieldGroups", "PositionBase,PositionView")
            .append_pair("$top", "100");
        if let Some(uic) = uic {
            url.query_pairs_mut().append_pair("Uics", &uic.to_string());
        }

        let listing: Option<ListEnvelope<Position>> = self.get(url).await?;

        Ok(listing.map(|l| l.data).unwrap_or_default())
    }

    /// Whether no position with a non-zero amount remains on the instrument.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the position listing fails.
    pub async fn is_flat(&self, uic: u64) -> Result<bool, EngineError> {
        let positions = self.list_positions(Some(uic)).await?;

        Ok(positions
            .iter()
            .all(|position| position.position_base.amount.is_zero()))
    }

    /// Find the order that carries the given external reference, used after
    /// an ambiguous submission to decide between resume and halt.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the order listing fails.
    pub async fn find_order_by_external_reference(
        &self,
        external_reference: &str,
    ) -> Result<Option<FoundOrder>, EngineError> {
        let orders = self.list_working_orders(None).await?;

        Ok(orders
            .into_iter()
            .find(|order| order.external_reference.as_deref() == Some(external_reference))
            .map(|order| FoundOrder {
                order_id: order.order_id,
                status: order.status,
            }))
    }

    /// Poll the audit route for proof that an order filled: up to 3 looks,
    /// 5 seconds apart, accepting `Fill`/`FinalFill` rows with a price.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a poll fails at the transport level.
    pub async fn check_order_status_via_audit(
        &self,
        order_id: &str,
    ) -> Result<Option<OrderActivity>, EngineError> {
        let (account_key, client_key) = self.keys().await?;

        for poll in 0..AUDIT_POLLS {
            if poll > 0 {
                tokio::time::sleep(AUDIT_POLL_WAIT).await;
            }

            let mut url = self.rest_endpoint("cs/v1/audit/orderactivities")?;
            url.query_pairs_mut()
                .append_pair("OrderId", order_id)
                .append_pair("EntryType", "Last")
                .append_pair("AccountKey", &account_key)
                .append_pair("ClientKey", &client_key);

            let listing: Option<ListEnvelope<OrderActivity>> = self.get(url).await?;
            let fill = listing
                .map(|l| l.data)
                .unwrap_or_default()
                .into_iter()
                .find(OrderActivity::is_fill);

            if fill.is_some() {
                return Ok(fill);
            }

            log::debug!("audit poll {} found no fill for order {order_id}", poll + 1);
        }

        Ok(None)
    }

    /// Pre-entry guard: does anything already exist on the instrument?
    /// Returns the presence flag plus a human summary for the log.
    ///
    /// # Errors
    ///
    /// Will return `Err` if either listing fails.
    pub async fn check_existing_positions_and_orders(
        &self,
        uic: u64,
    ) -> Result<(bool, Option<String>), EngineError> {
        let positions = self.list_positions(Some(uic)).await?;
        let open: Vec<_> = positions
            .iter()
            .filter(|position| !position.position_base.amount.is_zero())
            .collect();
        let orders = self.list_working_orders(Some(uic)).await?;

        if open.is_empty() && orders.is_empty() {
            return Ok((false, None));
        }

        let summary = format!(
            "{} open position(s), {} working order(s) on uic {uic}",
            open.len(),
            orders.len()
        );

        Ok((true, Some(summary)))
    }

    // ------------------------------------------------------------------
    // Streaming session routes
    // ------------------------------------------------------------------

    /// Create an ENS activities subscription in the given context and record
    /// it on the session.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Subscription`] if the broker refuses it.
    pub async fn create_ens_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
    ) -> Result<EnsSubscription, EngineError> {
        let (account_key, client_key) = self.keys().await?;
        let url = self.rest_endpoint("ens/v1/activities/subscriptions")?;

        let request = SubscriptionRequest {
            context_id: context_id.to_owned(),
            reference_id: reference_id.to_owned(),
            arguments: SubscriptionArguments {
                activities: vec!["Orders".to_owned(), "Positions".to_owned()],
                account_key,
                client_key,
            },
        };

        let body = serde_json::to_value(&request)?;
        let subscription: EnsSubscription = self
            .call(Method::POST, url, Some(body), RetryPolicy::Safe)
            .await?
            .ok_or_else(|| {
                EngineError::Subscription("subscription route returned nothing".to_owned())
            })?;

        self.set_streaming_context(
            subscription.context_id.clone(),
            subscription.reference_id.clone(),
        )
        .await;

        log::info!(
            "ENS subscription {} created in context {}",
            subscription.reference_id,
            subscription.context_id
        );

        Ok(subscription)
    }

    /// Delete an ENS subscription by its reference id.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the retry ladder exhausts.
    pub async fn delete_ens_subscription(&self, reference_id: &str) -> Result<(), EngineError> {
        let url =
            self.rest_endpoint(&format!("ens/v1/activities/subscriptions/{reference_id}"))?;

        let _: Option<serde_json::Value> =
            self.call(Method::DELETE, url, None, RetryPolicy::Safe).await?;

        log::info!("ENS subscription {reference_id} deleted");

        Ok(())
    }

    /// Re-authorize the streaming context with the current bearer, after a
    /// token refresh. Returns `false` once the route has 404'd — the feature
    /// is absent in this environment and further attempts are pointless.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the retry ladder exhausts.
    pub async fn authorize_streaming_context(
        &self,
        context_id: &str,
    ) -> Result<bool, EngineError> {
        if !self.streaming_authorize_supported.load(Ordering::Relaxed) {
            return Ok(false);
        }

        let mut url = self.rest_endpoint("streamingws/authorize")?;
        url.query_pairs_mut().append_pair("contextId", context_id);

        let result: Option<serde_json::Value> =
            self.call(Method::POST, url, None, RetryPolicy::Safe).await?;

        // `call` maps a 404 to None without retrying.
        if result.is_none() && !self.probe_streaming_authorize(context_id).await {
            self.streaming_authorize_supported
                .store(false, Ordering::Relaxed);
            log::warn!("streamingws/authorize not available, disabling re-authorization");
            return Ok(false);
        }

        log::debug!("streaming context {context_id} re-authorized");

        Ok(true)
    }

    /// Distinguish "404, route absent" from "2xx with empty body" — both
    /// reach us as `None` from the retry ladder.
    async fn probe_streaming_authorize(&self, context_id: &str) -> bool {
        let Ok(mut url) = self.rest_endpoint("streamingws/authorize") else {
            return false;
        };
        url.query_pairs_mut().append_pair("contextId", context_id);
        let Ok(token) = self.bearer().await else {
            return false;
        };

        match self.http.post(url).bearer_auth(token).send().await {
            Ok(response) => response.status().as_u16() != 404 && response.status().as_u16() != 405,
            Err(_) => true,
        }
    }

    // ------------------------------------------------------------------
    // TP/SL memoization
    // ------------------------------------------------------------------

    /// Remember the bracket order ids attached to an entry so the exit can
    /// retire them.
    pub async fn memoize_related_orders(&self, uic: u64, order_ids: Vec<String>) {
        if order_ids.is_empty() {
            return;
        }
        let mut map = self.tp_sl_order_ids_by_uic.lock().await;
        map.entry(uic).or_default().extend(order_ids);
    }

    /// The bracket order ids currently memoized for an instrument.
    pub async fn related_order_ids(&self, uic: u64) -> Vec<String> {
        self.tp_sl_order_ids_by_uic
            .lock()
            .await
            .get(&uic)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget one bracket order id, in any instrument's set. Called when the
    /// stream reports the order canceled or otherwise gone.
    pub async fn remove_related_order(&self, order_id: &str) {
        let mut map = self.tp_sl_order_ids_by_uic.lock().await;
        for ids in map.values_mut() {
            ids.retain(|id| id != order_id);
        }
        map.retain(|_, ids| !ids.is_empty());
    }

    /// Forget every bracket order id memoized for an instrument.
    pub async fn clear_related_orders(&self, uic: u64) {
        self.tp_sl_order_ids_by_uic.lock().await.remove(&uic);
    }
}

/// Honor a `Retry-After` header, defaulting to 5 seconds.
fn retry_after(response: &reqwest::Response) -> Duration {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map_or(Duration::from_secs(5), Duration::from_secs)
}
