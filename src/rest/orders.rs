//! Order placement and cancellation routes of the broker client.

use reqwest::Method;
use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::rest::data::{
    OrderDuration, OrderRequest, OrderResponse, PriceInfo, RelatedOrderRequest,
};
use crate::rest::{BrokerClient, RetryPolicy};
use crate::trade::{pip_value_for_pair, round_price, Side};

/// Outcome of a close request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Nothing left to close; the position was already flat.
    AlreadyClosed,
    /// Close order accepted, carrying the order id to confirm against.
    Submitted(String),
    /// The request went out but no usable response came back; the caller
    /// must probe by external reference before doing anything else.
    Ambiguous,
}

impl BrokerClient {
    /// Submit a market order with attached Stop (stop-loss) and Limit
    /// (take-profit) bracket legs.
    ///
    /// Bracket prices are displaced from the current ask (Buy) or bid (Sell)
    /// by `pips × pip_value` and rounded half-up to the instrument decimals.
    /// The bracket leg ids are memoized per UIC so the exit can cancel them.
    ///
    /// Returns `Ok(None)` when the outcome is ambiguous: the order may or may
    /// not exist, and only a probe by external reference can tell.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::OrderRejected`] when the broker answers
    /// with an explicit order error.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_market_order_with_brackets(
        &self,
        uic: u64,
        pair: &str,
        side: Side,
        amount: Decimal,
        decimals: u32,
        stop_loss_pips: Decimal,
        take_profit_pips: Decimal,
        price: &PriceInfo,
        external_reference: &str,
    ) -> Result<Option<String>, EngineError> {
        let pip = pip_value_for_pair(pair);
        let anchor = match side {
            Side::Buy => price.ask,
            Side::Sell => price.bid,
        };
        let sign = side.sign();

        let stop_price = round_price(anchor - sign * stop_loss_pips * pip, decimals);
        let limit_price = round_price(anchor + sign * take_profit_pips * pip, decimals);
        let exit_side = side.opposite().as_str().to_owned();

        let brackets = vec![
            RelatedOrderRequest {
                order_type: "Stop".to_owned(),
                order_price: stop_price,
                buy_sell: exit_side.clone(),
                amount,
                order_duration: OrderDuration {
                    duration_type: "GoodTillCancel".to_owned(),
                },
            },
            RelatedOrderRequest {
                order_type: "Limit".to_owned(),
                order_price: limit_price,
                buy_sell: exit_side,
                amount,
                order_duration: OrderDuration {
                    duration_type: "GoodTillCancel".to_owned(),
                },
            },
        ];

        let request = self
            .market_order_request(uic, side, amount, external_reference)
            .await?;
        let request = OrderRequest {
            orders: Some(brackets),
            ..request
        };

        let Some(response) = self.submit_order(request).await? else {
            return Ok(None);
        };

        let Some(order_id) = self.principal_order_id(&response)? else {
            return Ok(None);
        };

        let related: Vec<String> = response
            .orders
            .iter()
            .filter_map(|placed| placed.order_id.clone())
            .collect();
        log::info!(
            "order {order_id} placed on uic {uic} with {} bracket leg(s)",
            related.len()
        );
        self.memoize_related_orders(uic, related).await;

        Ok(Some(order_id))
    }

    /// Submit a flat market order, the fallback when brackets are disabled
    /// or refused. Same ambiguity contract as the bracket variant.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::OrderRejected`] when the broker answers
    /// with an explicit order error.
    pub async fn place_market_order(
        &self,
        uic: u64,
        side: Side,
        amount: Decimal,
        external_reference: &str,
    ) -> Result<Option<String>, EngineError> {
        let request = self
            .market_order_request(uic, side, amount, external_reference)
            .await?;

        let Some(response) = self.submit_order(request).await? else {
            return Ok(None);
        };

        Ok(self.principal_order_id(&response)?)
    }

    /// Close a position with a market order in the opposite direction.
    ///
    /// Consults the current position first: a vanished or zero position is
    /// reported as [`CloseOutcome::AlreadyClosed`]; otherwise the close
    /// amount is the smaller of the live amount and the requested one.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::OrderRejected`] when the broker answers
    /// with an explicit order error.
    pub async fn close_position_market(
        &self,
        position_id: &str,
        uic: u64,
        amount: Decimal,
        original_side: Side,
        external_reference: &str,
    ) -> Result<CloseOutcome, EngineError> {
        let positions = self.list_positions(Some(uic)).await?;
        let Some(position) = positions
            .iter()
            .find(|position| position.position_id == position_id)
        else {
            return Ok(CloseOutcome::AlreadyClosed);
        };

        let live = position.position_base.amount.abs();
        if live.is_zero() {
            return Ok(CloseOutcome::AlreadyClosed);
        }

        let close_amount = live.min(amount.abs());
        let request = self
            .market_order_request(uic, original_side.opposite(), close_amount, external_reference)
            .await?;
        let request = OrderRequest {
            to_open_close: Some("ToClose".to_owned()),
            position_id: Some(position_id.to_owned()),
            ..request
        };

        let Some(response) = self.submit_order(request).await? else {
            return Ok(CloseOutcome::Ambiguous);
        };

        match self.principal_order_id(&response)? {
            Some(order_id) => Ok(CloseOutcome::Submitted(order_id)),
            None => Ok(CloseOutcome::Ambiguous),
        }
    }

    /// Cancel one order. An order the broker no longer knows counts as
    /// canceled.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the retry ladder exhausts.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError> {
        let (account_key, _) = self.keys().await?;
        let mut url = self.rest_endpoint(&format!("trade/v2/orders/{order_id}"))?;
        url.query_pairs_mut().append_pair("AccountKey", &account_key);

        let result: Option<serde_json::Value> =
            self.call(Method::DELETE, url, None, RetryPolicy::Safe).await?;
        if result.is_none() {
            log::debug!("cancel of {order_id} returned no body");
        }

        Ok(())
    }

    /// Two-phase cancel of the memoized TP/SL orders on an instrument.
    ///
    /// Phase one cancels the memoized ids. The working orders are then
    /// re-listed; any memoized id still present is canceled again. If some
    /// survive even that, every working order on the UIC is asked to cancel
    /// as a last resort. On return, the memoized set for the UIC is empty.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a listing fails; individual cancel failures are
    /// logged and drive the escalation instead of aborting it.
    pub async fn cancel_related_orders_for_uic(&self, uic: u64) -> Result<(), EngineError> {
        let memoized = self.related_order_ids(uic).await;
        if memoized.is_empty() {
            // Nothing memoized (fresh process after a restart, or brackets
            // disabled); anything still working on the instrument is ours.
            let orders = self.list_working_orders(Some(uic)).await?;
            for order in orders {
                log::info!("canceling working order {} left on uic {uic}", order.order_id);
                if let Err(err) = self.cancel_order(&order.order_id).await {
                    log::warn!("cancel of {} failed: {err}", order.order_id);
                }
            }
            return Ok(());
        }

        for order_id in &memoized {
            if let Err(err) = self.cancel_order(order_id).await {
                log::warn!("cancel of bracket order {order_id} failed: {err}");
            }
        }

        let still_working = |orders: &[crate::rest::data::WorkingOrder]| -> Vec<String> {
            orders
                .iter()
                .filter(|order| memoized.contains(&order.order_id))
                .map(|order| order.order_id.clone())
                .collect()
        };

        let listed = self.list_working_orders(Some(uic)).await?;
        let mut remaining = still_working(&listed);

        if !remaining.is_empty() {
            log::warn!(
                "{} bracket order(s) on uic {uic} survived the first cancel pass",
                remaining.len()
            );
            for order_id in &remaining {
                if let Err(err) = self.cancel_order(order_id).await {
                    log::warn!("cancel retry of bracket order {order_id} failed: {err}");
                }
            }

            let listed = self.list_working_orders(Some(uic)).await?;
            remaining = still_working(&listed);
        }

        if !remaining.is_empty() {
            log::error!(
                "bracket orders on uic {uic} still working after two passes; canceling all working orders"
            );
            for order in self.list_working_orders(Some(uic)).await? {
                if let Err(err) = self.cancel_order(&order.order_id).await {
                    log::warn!("blanket cancel of {} failed: {err}", order.order_id);
                }
            }
        }

        self.clear_related_orders(uic).await;

        Ok(())
    }

    async fn market_order_request(
        &self,
        uic: u64,
        side: Side,
        amount: Decimal,
        external_reference: &str,
    ) -> Result<OrderRequest, EngineError> {
        let (account_key, _) = self.keys().await?;

        Ok(OrderRequest {
            account_key,
            uic,
            asset_type: "FxSpot".to_owned(),
            amount,
            buy_sell: side.as_str().to_owned(),
            order_type: "Market".to_owned(),
            order_duration: OrderDuration {
                duration_type: "DayOrder".to_owned(),
            },
            external_reference: external_reference.to_owned(),
            manual_order: false,
            orders: None,
            to_open_close: None,
            position_id: None,
        })
    }

    /// `POST /trade/v2/orders` under the no-retry policy. `Ok(None)` is the
    /// ambiguous case the callers resolve by probing.
    async fn submit_order(
        &self,
        request: OrderRequest,
    ) -> Result<Option<OrderResponse>, EngineError> {
        let url = self.rest_endpoint("trade/v2/orders")?;
        let body = serde_json::to_value(&request)?;

        self.call(Method::POST, url, Some(body), RetryPolicy::OrderSubmit)
            .await
    }

    /// Extract the principal order id, surfacing a 2xx `ErrorInfo` as a
    /// rejection.
    fn principal_order_id(
        &self,
        response: &OrderResponse,
    ) -> Result<Option<String>, EngineError> {
        if let Some(ref error) = response.error_info {
            return Err(EngineError::OrderRejected(error.to_string()));
        }

        Ok(response.order_id.clone())
    }
}
