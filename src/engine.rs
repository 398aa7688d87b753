//! The orchestrator: walks the trade plan through entry and exit on
//! schedule, confirms fills over the stream (audit route as fallback),
//! persists every transition, and keeps the session alive underneath.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::ens::client::EnsClient;
use crate::ens::EnsEventKind;
use crate::error::EngineError;
use crate::notify::NotifyLevel;
use crate::prelude::SharedNotifier;
use crate::rest::auth::AuthorizationCodeProvider;
use crate::rest::data::PriceInfo;
use crate::rest::orders::CloseOutcome;
use crate::rest::BrokerClient;
use crate::scheduler::{target_today, wait_until_with_pings, WaitOutcome};
use crate::state::{merge_records, StateStore};
use crate::trade::{
    EntryFailReason, ExitFailReason, OrderLeg, SkipReason, Trade, TradeStatus,
};
use crate::waiters::WaiterRegistry;

/// Latest acceptable submission is this many seconds after the scheduled
/// moment.
const ENTRY_DEADLINE_SECS: i64 = 3;
/// Flat confirmation polls the position this often…
const FLAT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// …up to this many times.
const FLAT_POLL_LIMIT: u32 = 60;

/// A plan entry shared between the main loop and its confirmation task.
type SharedTrade = Arc<Mutex<Trade>>;

/// Everything a confirmation task needs, detached from the engine.
#[derive(Clone)]
struct TaskCtx {
    broker: Arc<BrokerClient>,
    registry: Arc<WaiterRegistry>,
    store: Arc<StateStore>,
    notifier: SharedNotifier,
    plan: Arc<Vec<SharedTrade>>,
    today: NaiveDate,
    fill_timeout: Duration,
}

impl core::fmt::Debug for TaskCtx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskCtx").field("today", &self.today).finish()
    }
}

/// The engine. Build one per process, hand it the day's plan, and `run` it.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    broker: Arc<BrokerClient>,
    ens: Arc<EnsClient>,
    registry: Arc<WaiterRegistry>,
    notifier: SharedNotifier,
    store: Arc<StateStore>,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    /// Wire up an engine over the given config, authorization-code provider,
    /// and notification sink.
    #[must_use]
    pub fn new(
        config: Config,
        provider: Arc<dyn AuthorizationCodeProvider>,
        notifier: SharedNotifier,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let broker = Arc::new(BrokerClient::new(config.clone(), provider));
        let registry = Arc::new(WaiterRegistry::new());
        let ens = EnsClient::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            Arc::clone(&notifier),
            config.clone(),
            Arc::clone(&shutdown),
        );
        let store = Arc::new(StateStore::new(config.state_file.clone()));

        Self {
            config,
            broker,
            ens,
            registry,
            notifier,
            store,
            shutdown,
        }
    }

    /// The broker client, for callers that want direct REST access.
    #[must_use]
    pub fn broker(&self) -> Arc<BrokerClient> {
        Arc::clone(&self.broker)
    }

    /// Flag that stops the engine at the next safe point; share it with a
    /// signal handler.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Request a stop: background loops wind down and `run` returns after
    /// in-flight confirmations complete.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.ens.wake_for_shutdown();
    }

    /// Execute the plan. Returns the final snapshot of every trade.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Halt`] when an ambiguous order outcome
    /// forces trading to stop, or any error from session establishment.
    pub async fn run(&self, plan: Vec<Trade>) -> Result<Vec<Trade>, EngineError> {
        self.broker.authenticate().await?;

        let today = Utc::now().with_timezone(&self.config.timezone).date_naive();
        let mut plan = plan;
        plan.sort_by_key(|trade| (trade.entry_time, trade.id));

        if let Some(records) = self.store.load(today).await? {
            merge_records(&mut plan, &records);
        }
        self.enrich_instruments(&mut plan).await;

        let plan: Arc<Vec<SharedTrade>> = Arc::new(
            plan.into_iter()
                .map(|trade| Arc::new(Mutex::new(trade)))
                .collect(),
        );
        let ctx = TaskCtx {
            broker: Arc::clone(&self.broker),
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
            plan: Arc::clone(&plan),
            today,
            fill_timeout: Duration::from_secs(self.config.fill_timeout_seconds),
        };

        persist_plan(&ctx).await;

        let stream_handles = self.ens.start();
        let refresher = self.spawn_refresher();

        let mut confirmations: Vec<JoinHandle<()>> = Vec::new();
        let mut halt: Option<String> = None;

        for shared in plan.iter() {
            if halt.is_some() || self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match self.run_trade(shared, &ctx, &mut confirmations).await {
                Ok(()) => {}
                Err(EngineError::Halt(reason)) => {
                    log::error!("halting trading: {reason}");
                    halt = Some(reason);
                }
                Err(err) => {
                    let id = shared.lock().await.id;
                    log::error!("trade {id} failed: {err}");
                    self.notifier
                        .notify(NotifyLevel::Warning, &format!("trade {id} failed: {err}"));
                }
            }
        }

        // Confirmation tasks persist their own outcomes; a panic in one must
        // not take the others down.
        for handle in confirmations {
            if let Err(err) = handle.await {
                log::error!("confirmation task ended abnormally: {err}");
            }
        }

        self.request_shutdown();
        refresher.abort();
        for handle in stream_handles {
            if tokio::time::timeout(Duration::from_secs(15), handle)
                .await
                .is_err()
            {
                log::warn!("stream task did not stop in time");
            }
        }

        if let Some(subscription_id) = self.ens.subscription_id().await {
            if let Err(err) = self.broker.delete_ens_subscription(&subscription_id).await {
                log::warn!("subscription cleanup failed: {err}");
            }
        }

        let mut snapshots = Vec::with_capacity(ctx.plan.len());
        for shared in ctx.plan.iter() {
            snapshots.push(shared.lock().await.clone());
        }

        if let Some(reason) = halt {
            self.notifier
                .notify(NotifyLevel::Critical, &format!("trading halted: {reason}"));
            return Err(EngineError::Halt(reason));
        }

        if snapshots.iter().all(|trade| trade.status.is_terminal()) {
            self.store.clear().await;
        }

        Ok(snapshots)
    }

    /// Resolve UIC/decimals for plan entries that still need them.
    async fn enrich_instruments(&self, plan: &mut [Trade]) {
        for trade in plan.iter_mut() {
            if trade.uic.is_some() || trade.status.is_terminal() {
                continue;
            }

            match self.broker.resolve_instrument(&trade.pair).await {
                Ok(Some(instrument)) => {
                    log::info!(
                        "{} resolved to uic {} ({})",
                        trade.pair,
                        instrument.identifier,
                        instrument.asset_type
                    );
                    trade.uic = Some(instrument.identifier);
                    trade.asset_type = instrument.asset_type;
                }
                Ok(None) => {
                    log::warn!("{} did not resolve to an instrument", trade.pair);
                }
                Err(err) => {
                    log::warn!("instrument lookup for {} failed: {err}", trade.pair);
                }
            }
        }
    }

    /// One trade, from wherever its recovered state puts it to a terminal
    /// state (confirmations excepted; those run concurrently).
    async fn run_trade(
        &self,
        shared: &SharedTrade,
        ctx: &TaskCtx,
        confirmations: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), EngineError> {
        let status = shared.lock().await.status;

        match status {
            TradeStatus::Pending => {
                let entry_confirm = self.entry_workflow(shared, ctx).await?;
                let Some(entry_confirm) = entry_confirm else {
                    return Ok(());
                };
                self.exit_workflow(shared, ctx, Some(entry_confirm), confirmations)
                    .await
            }
            TradeStatus::EntrySubmitted => {
                // Recovered mid-confirmation: re-arm the fill waiter.
                let trade = shared.lock().await;
                let (Some(order_id), Some(uic)) = (trade.entry_order_id.clone(), trade.uic)
                else {
                    drop(trade);
                    self.mark(shared, ctx, TradeStatus::EntryFailed(EntryFailReason::Unknown))
                        .await;
                    return Ok(());
                };
                drop(trade);

                let handle = spawn_entry_confirmation(ctx.clone(), Arc::clone(shared), order_id, uic);
                self.exit_workflow(shared, ctx, Some(handle), confirmations)
                    .await
            }
            TradeStatus::Entered => self.exit_workflow(shared, ctx, None, confirmations).await,
            TradeStatus::ExitSubmitted => {
                let trade = shared.lock().await;
                let (Some(order_id), Some(uic)) = (trade.exit_order_id.clone(), trade.uic) else {
                    drop(trade);
                    self.mark(shared, ctx, TradeStatus::ExitFailed(ExitFailReason::Unconfirmed))
                        .await;
                    return Ok(());
                };
                drop(trade);

                confirmations.push(spawn_exit_confirmation(
                    ctx.clone(),
                    Arc::clone(shared),
                    order_id,
                    uic,
                ));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Entry
    // ------------------------------------------------------------------

    /// Drive one trade to `entry-submitted` and spawn its confirmation.
    /// Returns the confirmation handle, or `None` when the trade ended in a
    /// terminal state without an order.
    async fn entry_workflow(
        &self,
        shared: &SharedTrade,
        ctx: &TaskCtx,
    ) -> Result<Option<JoinHandle<()>>, EngineError> {
        let trade = shared.lock().await.clone();
        let tz = self.config.timezone;
        let now = Utc::now().with_timezone(&tz);

        if let Some(ref weekdays) = trade.allowed_weekdays {
            if !weekdays.contains(&now.weekday()) {
                self.mark(shared, ctx, TradeStatus::Skipped(SkipReason::Weekday))
                    .await;
                return Ok(None);
            }
        }

        let Some(uic) = trade.uic else {
            self.mark(shared, ctx, TradeStatus::Skipped(SkipReason::UicMissing))
                .await;
            return Ok(None);
        };

        let Some(target) = target_today(now, trade.entry_time) else {
            self.mark(shared, ctx, TradeStatus::Skipped(SkipReason::TimePast))
                .await;
            return Ok(None);
        };

        let broker = Arc::clone(&self.broker);
        let outcome = wait_until_with_pings(target, self.config.random_delay_sec, move || {
            let broker = Arc::clone(&broker);
            async move { broker.validate_token().await }
        })
        .await;

        match outcome {
            WaitOutcome::Completed => {}
            WaitOutcome::AlreadyPast => {
                self.mark(shared, ctx, TradeStatus::Skipped(SkipReason::TimePast))
                    .await;
                return Ok(None);
            }
            WaitOutcome::PreCheckFailed => {
                self.mark(shared, ctx, TradeStatus::Skipped(SkipReason::PreCheckFailed))
                    .await;
                return Ok(None);
            }
        }

        let (present, summary) = self.broker.check_existing_positions_and_orders(uic).await?;
        if present {
            log::warn!(
                "trade {} blocked by existing exposure: {}",
                trade.id,
                summary.unwrap_or_default()
            );
            self.mark(shared, ctx, TradeStatus::Skipped(SkipReason::Existing))
                .await;
            return Ok(None);
        }

        let price = match self.fetch_price(uic).await {
            Some(price) => price,
            None => {
                self.mark(
                    shared,
                    ctx,
                    TradeStatus::EntryFailed(EntryFailReason::OrderError),
                )
                .await;
                return Ok(None);
            }
        };

        let spread_pips = price.spread_pips(trade.pip_value());
        if spread_pips > self.config.spread_pips_limit {
            log::warn!(
                "trade {} spread {spread_pips} pips over limit {}",
                trade.id,
                self.config.spread_pips_limit
            );
            self.mark(shared, ctx, TradeStatus::Skipped(SkipReason::Spread))
                .await;
            return Ok(None);
        }

        // The price snapshot carries the authoritative precision; bracket
        // rounding must use it, not the plan default.
        if price.decimals != trade.decimals {
            shared.lock().await.decimals = price.decimals;
        }

        let external_reference = trade.external_reference(ctx.today, OrderLeg::Entry);
        let deadline = target + chrono::Duration::seconds(ENTRY_DEADLINE_SECS);
        let max_attempts = (1 + self.config.entry_retry_count).max(2);
        let mut attempt = 0;

        let order_id = loop {
            if Utc::now().with_timezone(&tz) > deadline {
                self.mark(
                    shared,
                    ctx,
                    TradeStatus::EntryFailed(EntryFailReason::TimeExceeded),
                )
                .await;
                return Ok(None);
            }
            attempt += 1;

            let submitted = if self.config.brackets_enabled {
                self.broker
                    .place_market_order_with_brackets(
                        uic,
                        &trade.pair,
                        trade.side,
                        trade.amount(),
                        price.decimals,
                        self.config.stop_loss_pips,
                        self.config.take_profit_pips,
                        &price,
                        &external_reference,
                    )
                    .await
            } else {
                self.broker
                    .place_market_order(uic, trade.side, trade.amount(), &external_reference)
                    .await
            };

            match submitted {
                Ok(Some(order_id)) => break order_id,
                Ok(None) => {
                    // The order may exist; only the idempotency tag can tell.
                    match self
                        .broker
                        .find_order_by_external_reference(&external_reference)
                        .await?
                    {
                        Some(found) => {
                            log::warn!(
                                "ambiguous submission resolved to order {} ({:?})",
                                found.order_id,
                                found.status
                            );
                            break found.order_id;
                        }
                        None => {
                            self.mark(
                                shared,
                                ctx,
                                TradeStatus::EntryFailed(EntryFailReason::Unknown),
                            )
                            .await;
                            return Err(EngineError::Halt(format!(
                                "order outcome unknown for {external_reference}; refusing to trade on"
                            )));
                        }
                    }
                }
                Err(err) => {
                    log::warn!("entry attempt {attempt} for trade {} failed: {err}", trade.id);
                    if attempt >= max_attempts {
                        self.mark(
                            shared,
                            ctx,
                            TradeStatus::EntryFailed(EntryFailReason::OrderError),
                        )
                        .await;
                        return Ok(None);
                    }
                }
            }
        };

        {
            let mut trade = shared.lock().await;
            trade.entry_order_id = Some(order_id.clone());
            trade.status = TradeStatus::EntrySubmitted;
        }
        persist_plan(ctx).await;
        log::info!("trade {} entry order {order_id} submitted", trade.id);

        Ok(Some(spawn_entry_confirmation(
            ctx.clone(),
            Arc::clone(shared),
            order_id,
            uic,
        )))
    }

    async fn fetch_price(&self, uic: u64) -> Option<PriceInfo> {
        match self.broker.fetch_price_infos(&[uic]).await {
            Ok(mut prices) => prices.remove(&uic),
            Err(err) => {
                log::error!("price snapshot for uic {uic} failed: {err}");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Exit
    // ------------------------------------------------------------------

    /// Wait out the hold, retire the brackets, close, and spawn the exit
    /// confirmation.
    async fn exit_workflow(
        &self,
        shared: &SharedTrade,
        ctx: &TaskCtx,
        entry_confirmation: Option<JoinHandle<()>>,
        confirmations: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), EngineError> {
        let trade = shared.lock().await.clone();
        let tz = self.config.timezone;

        let Some(uic) = trade.uic else {
            return Ok(());
        };

        let wait_outcome = match target_today(Utc::now().with_timezone(&tz), trade.exit_time) {
            Some(target) => {
                let broker = Arc::clone(&self.broker);
                wait_until_with_pings(target, self.config.random_delay_sec, move || {
                    let broker = Arc::clone(&broker);
                    async move { broker.validate_token().await }
                })
                .await
            }
            // A vanished wall-clock time still has a position behind it.
            None => WaitOutcome::AlreadyPast,
        };

        if let Some(handle) = entry_confirmation {
            if let Err(err) = handle.await {
                log::error!("entry confirmation task ended abnormally: {err}");
            }
        }

        let trade = shared.lock().await.clone();
        if trade.status != TradeStatus::Entered {
            log::info!(
                "trade {} is `{}` at exit time, nothing to close",
                trade.id,
                trade.status
            );
            return Ok(());
        }

        if wait_outcome == WaitOutcome::PreCheckFailed {
            // Unlike an entry, an exit cannot be skipped; re-establish the
            // session and press on.
            log::warn!("pre-exit ping failed for trade {}, re-authenticating", trade.id);
            if let Err(err) = self.broker.authenticate().await {
                self.notifier.notify(
                    NotifyLevel::Critical,
                    &format!("cannot re-authenticate before exit of trade {}: {err}", trade.id),
                );
                self.mark(shared, ctx, TradeStatus::ExitFailed(ExitFailReason::OrderError))
                    .await;
                return Ok(());
            }
        }

        let position_id = match trade.position_id.clone() {
            Some(position_id) => position_id,
            None => {
                // Entered without a position id (audit gap); adopt whatever
                // position is open on the instrument.
                match self.recover_position_id(shared, ctx, uic).await? {
                    Some(position_id) => position_id,
                    None => {
                        self.mark(shared, ctx, TradeStatus::ClosedPreClosed).await;
                        return Ok(());
                    }
                }
            }
        };

        let positions = self.broker.list_positions(Some(uic)).await?;
        let still_open = positions.iter().any(|position| {
            position.position_id == position_id && !position.position_base.amount.is_zero()
        });
        if !still_open {
            log::info!("trade {} position already gone", trade.id);
            self.mark(shared, ctx, TradeStatus::ClosedPreClosed).await;
            return Ok(());
        }

        self.broker.cancel_related_orders_for_uic(uic).await?;

        let external_reference = trade.external_reference(ctx.today, OrderLeg::Exit);
        let amount = trade.entry_filled_amount.unwrap_or_else(|| trade.amount());
        let max_attempts = (1 + self.config.exit_retry_count).max(2);

        for attempt in 1..=max_attempts {
            let outcome = self
                .broker
                .close_position_market(&position_id, uic, amount, trade.side, &external_reference)
                .await;

            match outcome {
                Ok(CloseOutcome::AlreadyClosed) => {
                    self.mark(shared, ctx, TradeStatus::ClosedPreClosed).await;
                    return Ok(());
                }
                Ok(CloseOutcome::Submitted(order_id)) => {
                    {
                        let mut trade = shared.lock().await;
                        trade.exit_order_id = Some(order_id.clone());
                        trade.status = TradeStatus::ExitSubmitted;
                    }
                    persist_plan(ctx).await;
                    log::info!("trade {} close order {order_id} submitted", trade.id);

                    confirmations.push(spawn_exit_confirmation(
                        ctx.clone(),
                        Arc::clone(shared),
                        order_id,
                        uic,
                    ));
                    return Ok(());
                }
                Ok(CloseOutcome::Ambiguous) => {
                    if let Some(found) = self
                        .broker
                        .find_order_by_external_reference(&external_reference)
                        .await?
                    {
                        log::warn!(
                            "ambiguous close resolved to order {} ({:?})",
                            found.order_id,
                            found.status
                        );
                        {
                            let mut trade = shared.lock().await;
                            trade.exit_order_id = Some(found.order_id.clone());
                            trade.status = TradeStatus::ExitSubmitted;
                        }
                        persist_plan(ctx).await;
                        confirmations.push(spawn_exit_confirmation(
                            ctx.clone(),
                            Arc::clone(shared),
                            found.order_id,
                            uic,
                        ));
                        return Ok(());
                    }
                    log::warn!("close attempt {attempt} for trade {} went nowhere", trade.id);
                }
                Err(err) => {
                    log::warn!("close attempt {attempt} for trade {} failed: {err}", trade.id);
                }
            }
        }

        self.notifier.notify(
            NotifyLevel::Critical,
            &format!("trade {} could not be closed", trade.id),
        );
        self.mark(shared, ctx, TradeStatus::ExitFailed(ExitFailReason::OrderError))
            .await;

        Ok(())
    }

    /// Adopt the open position on the instrument for a recovered trade that
    /// never learned its position id. `None` means the instrument is flat.
    async fn recover_position_id(
        &self,
        shared: &SharedTrade,
        ctx: &TaskCtx,
        uic: u64,
    ) -> Result<Option<String>, EngineError> {
        let positions = self.broker.list_positions(Some(uic)).await?;
        let Some(position) = positions
            .into_iter()
            .find(|position| !position.position_base.amount.is_zero())
        else {
            return Ok(None);
        };

        {
            let mut trade = shared.lock().await;
            trade.position_id = Some(position.position_id.clone());
        }
        persist_plan(ctx).await;

        Ok(Some(position.position_id))
    }

    async fn mark(&self, shared: &SharedTrade, ctx: &TaskCtx, status: TradeStatus) {
        set_status(shared, ctx, status).await;
    }

    // ------------------------------------------------------------------
    // Token refresher
    // ------------------------------------------------------------------

    /// Periodic refresh of the access token, followed by re-authorization of
    /// the streaming context. Refresh is mutually exclusive inside the
    /// broker client.
    fn spawn_refresher(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let notifier = Arc::clone(&self.notifier);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = Duration::from_secs(self.config.token_refresh_interval_seconds.max(60));
        let authorize_stream = self.config.streaming_authorize_enabled;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                match broker.refresh_access_token().await {
                    Ok(()) => {
                        if authorize_stream {
                            let context_id = broker.session().await.streaming_context_id;
                            if let Some(context_id) = context_id {
                                if let Err(err) =
                                    broker.authorize_streaming_context(&context_id).await
                                {
                                    log::warn!("stream re-authorization failed: {err}");
                                }
                            }
                        }
                    }
                    Err(EngineError::RefreshRejected) => {
                        log::warn!("refresh token rejected, running full authorize");
                        if let Err(err) = broker.authenticate().await {
                            notifier.notify(
                                NotifyLevel::Critical,
                                &format!("session could not be re-established: {err}"),
                            );
                        }
                    }
                    Err(err) => {
                        log::error!("token refresh failed: {err}");
                        notifier
                            .notify(NotifyLevel::Warning, &format!("token refresh failed: {err}"));
                    }
                }
            }

            log::info!("token refresher stopped");
        })
    }
}

/// Set a trade's status and persist the plan.
async fn set_status(shared: &SharedTrade, ctx: &TaskCtx, status: TradeStatus) {
    {
        let mut trade = shared.lock().await;
        log::info!("trade {}: `{}` -> `{status}`", trade.id, trade.status);
        trade.status = status;
    }
    persist_plan(ctx).await;
}

/// Snapshot the whole plan and write the state file.
async fn persist_plan(ctx: &TaskCtx) {
    let mut snapshot = Vec::with_capacity(ctx.plan.len());
    for shared in ctx.plan.iter() {
        snapshot.push(shared.lock().await.clone());
    }

    if let Err(err) = ctx.store.save(ctx.today, &snapshot).await {
        log::error!("state persistence failed: {err}");
    }
}

/// Await the entry fill over the stream, fall back to the audit route, and
/// advance the trade to `entered`.
fn spawn_entry_confirmation(
    ctx: TaskCtx,
    shared: SharedTrade,
    order_id: String,
    uic: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = ctx
            .registry
            .wait_for(
                Some(order_id.clone()),
                uic,
                vec![EnsEventKind::OrderFill],
                ctx.fill_timeout,
            )
            .await;

        let fill = match event {
            Some(event) => Some((
                event.execution_price,
                event.position_id,
                event.execution_time,
                event.filled_amount,
            )),
            None => {
                log::warn!("no stream fill for order {order_id}, probing the audit route");
                match ctx.broker.check_order_status_via_audit(&order_id).await {
                    Ok(Some(activity)) => Some((
                        activity.average_price,
                        activity.position_id,
                        activity.activity_time,
                        activity.filled_amount,
                    )),
                    Ok(None) => None,
                    Err(err) => {
                        log::error!("audit probe for order {order_id} failed: {err}");
                        None
                    }
                }
            }
        };

        let Some((price, position_id, time, filled)) = fill else {
            let id = shared.lock().await.id;
            ctx.notifier.notify(
                NotifyLevel::Warning,
                &format!("entry fill of trade {id} unconfirmed"),
            );
            set_status(
                &shared,
                &ctx,
                TradeStatus::EntryFailed(EntryFailReason::Unconfirmed),
            )
            .await;
            return;
        };

        let position_id = match position_id {
            Some(position_id) => Some(position_id),
            None => first_open_position(&ctx.broker, uic).await,
        };

        let id = {
            let mut trade = shared.lock().await;
            trade.entry_fill_price = price;
            trade.position_id = position_id;
            trade.entry_timestamp_actual = Some(time.unwrap_or_else(Utc::now));
            let amount = trade.amount();
            trade.entry_filled_amount = Some(filled.unwrap_or(amount));
            trade.status = TradeStatus::Entered;
            trade.id
        };
        persist_plan(&ctx).await;

        ctx.notifier.notify(
            NotifyLevel::Info,
            &format!("trade {id} entered at {}", display_price(price)),
        );
    })
}

/// Await the close fill (audit fallback), verify the instrument is flat, and
/// settle the trade.
fn spawn_exit_confirmation(
    ctx: TaskCtx,
    shared: SharedTrade,
    order_id: String,
    uic: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = ctx
            .registry
            .wait_for(
                Some(order_id.clone()),
                uic,
                vec![EnsEventKind::OrderFill],
                ctx.fill_timeout,
            )
            .await;

        let (price, time) = match event {
            Some(event) => (event.execution_price, event.execution_time),
            None => {
                log::warn!("no stream fill for close {order_id}, probing the audit route");
                match ctx.broker.check_order_status_via_audit(&order_id).await {
                    Ok(Some(activity)) => (activity.average_price, activity.activity_time),
                    _ => (None, None),
                }
            }
        };

        let flat = confirm_flat(&ctx.broker, uic).await;
        let id = {
            let mut trade = shared.lock().await;
            trade.exit_fill_price = price;
            trade.exit_timestamp_actual = Some(time.unwrap_or_else(Utc::now));
            trade.status = if !flat {
                TradeStatus::ExitFailed(ExitFailReason::Unconfirmed)
            } else if price.is_some() {
                trade.settle_pips();
                TradeStatus::Closed
            } else {
                TradeStatus::ClosedPriceUnknown
            };
            trade.id
        };
        persist_plan(&ctx).await;

        let trade = shared.lock().await;
        match trade.status {
            TradeStatus::Closed => ctx.notifier.notify(
                NotifyLevel::Info,
                &format!(
                    "trade {id} closed at {} ({} pips)",
                    display_price(trade.exit_fill_price),
                    trade
                        .pips_profit
                        .map_or_else(|| "?".to_owned(), |pips| pips.to_string())
                ),
            ),
            TradeStatus::ClosedPriceUnknown => ctx.notifier.notify(
                NotifyLevel::Warning,
                &format!("trade {id} flat, but the exit price is unknown"),
            ),
            _ => ctx.notifier.notify(
                NotifyLevel::Critical,
                &format!("trade {id} not confirmed flat after close"),
            ),
        }
    })
}

/// Poll the instrument until flat, once per second for a minute.
async fn confirm_flat(broker: &Arc<BrokerClient>, uic: u64) -> bool {
    for _ in 0..FLAT_POLL_LIMIT {
        match broker.is_flat(uic).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(err) => log::warn!("flat check on uic {uic} failed: {err}"),
        }
        tokio::time::sleep(FLAT_POLL_INTERVAL).await;
    }

    false
}

/// First open position on the instrument, for fills whose events omitted it.
async fn first_open_position(broker: &Arc<BrokerClient>, uic: u64) -> Option<String> {
    match broker.list_positions(Some(uic)).await {
        Ok(positions) => positions
            .into_iter()
            .find(|position| !position.position_base.amount.is_zero())
            .map(|position| position.position_id),
        Err(err) => {
            log::warn!("position lookup on uic {uic} failed: {err}");
            None
        }
    }
}

fn display_price(price: Option<rust_decimal::Decimal>) -> String {
    price.map_or_else(|| "?".to_owned(), |price| price.to_string())
}
