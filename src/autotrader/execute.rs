// =============================================================================
// Decision Execution — routes model decisions through safety gates and the
// venue adapter
// =============================================================================
//
// Every action runs its own precondition ladder before any venue call:
// duplicate-open refusal, minimum notional, price-source consistency, the
// margin gate, and protective-price side-coherence. Failures are returned as
// the action's error and never abort the cycle.
//
// Protective-order coupling is handled here:
//   - after a partial close the venue has dropped the old SL/TP, so both are
//     re-placed against the remaining quantity;
//   - after an SL (resp. TP) adjustment the recorded TP (resp. SL) is
//     re-placed as well, for venues that cancel protective orders as a group.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::exchange::{OrderStatus, VenuePosition, KEY_AVAILABLE_BALANCE};
use crate::persistence::TradeRecord;
use crate::record::ActionResult;
use crate::types::{position_key, Decision, DecisionAction, PositionSide, TradeKind};

use super::AutoTrader;
use crate::config::OrderStrategy;

/// Smallest acceptable opening size in quote units. The venue enforces its
/// own minimum; this pre-check produces a fast, attributable refusal.
const MIN_OPEN_NOTIONAL: f64 = 10.0;

/// A partial close leaving at most this much value behind becomes a full
/// close.
const MIN_RESIDUAL_VALUE: f64 = 10.0;

/// Maximum tolerated disagreement between the venue price and the market-data
/// price before an open is refused.
const MAX_SOURCE_SPREAD: f64 = 0.02;

/// Which protective order an adjustment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protective {
    StopLoss,
    TakeProfit,
}

// ---------------------------------------------------------------------------
// Protective-price side-coherence
// ---------------------------------------------------------------------------

/// A stop-loss must sit on the losing side of the current price.
pub(crate) fn valid_stop_loss(side: PositionSide, price: f64, stop_loss: f64) -> bool {
    match side {
        PositionSide::Long => stop_loss > 0.0 && stop_loss < price,
        PositionSide::Short => stop_loss > price,
    }
}

/// A take-profit must sit on the winning side of the current price.
pub(crate) fn valid_take_profit(side: PositionSide, price: f64, take_profit: f64) -> bool {
    match side {
        PositionSide::Long => take_profit > price,
        PositionSide::Short => take_profit > 0.0 && take_profit < price,
    }
}

// ---------------------------------------------------------------------------
// Order-strategy outcome
// ---------------------------------------------------------------------------

/// What the order strategy actually did to get the position opened.
#[derive(Debug, Clone)]
pub(crate) struct OpenPlacement {
    pub order_id: String,
    pub fill_price: f64,
    /// True when a hybrid limit order timed out and fell back to market.
    pub converted_to_market: bool,
    /// The original limit order id when a conversion happened.
    pub original_order_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl AutoTrader {
    /// Execute one decision and report the outcome. Never panics, never
    /// propagates: every failure lands in the returned result.
    pub(crate) async fn execute_decision(&self, decision: &Decision) -> ActionResult {
        let outcome = match decision.action {
            DecisionAction::OpenLong => self.handle_open(decision, PositionSide::Long).await,
            DecisionAction::OpenShort => self.handle_open(decision, PositionSide::Short).await,
            DecisionAction::CloseLong => self.handle_close(decision, PositionSide::Long).await,
            DecisionAction::CloseShort => self.handle_close(decision, PositionSide::Short).await,
            DecisionAction::PartialClose => self.handle_partial_close(decision).await,
            DecisionAction::UpdateStopLoss => {
                self.handle_update_protection(decision, Protective::StopLoss).await
            }
            DecisionAction::UpdateTakeProfit => {
                self.handle_update_protection(decision, Protective::TakeProfit).await
            }
            DecisionAction::Hold | DecisionAction::Wait => Ok(format!(
                "no action taken{}",
                if decision.reasoning.is_empty() {
                    String::new()
                } else {
                    format!(": {}", decision.reasoning)
                }
            )),
        };

        match outcome {
            Ok(detail) => {
                info!(
                    action = %decision.action,
                    symbol = %decision.symbol,
                    detail = %detail,
                    "action executed"
                );
                ActionResult::ok_with(decision.action, &decision.symbol, detail)
            }
            Err(e) => {
                warn!(
                    action = %decision.action,
                    symbol = %decision.symbol,
                    error = %format!("{e:#}"),
                    "action failed"
                );
                ActionResult::failed(decision.action, &decision.symbol, format!("{e:#}"))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    async fn handle_open(&self, decision: &Decision, side: PositionSide) -> Result<String> {
        let symbol = decision.symbol.as_str();
        let key = position_key(symbol, side);

        if decision.position_size_usd < MIN_OPEN_NOTIONAL {
            anyhow::bail!(
                "position size {:.2} below the {MIN_OPEN_NOTIONAL} minimum",
                decision.position_size_usd
            );
        }

        let leverage = if decision.leverage == 0 {
            self.config.default_leverage(symbol)
        } else {
            decision.leverage
        };

        // One position per (symbol, side): the model must close first.
        let positions = self.exchange.get_positions().await?;
        if positions
            .iter()
            .any(|p| p.symbol == symbol && p.side == side && p.quantity() > 0.0)
        {
            anyhow::bail!("a {side} position on {symbol} already exists; close it before re-opening");
        }

        let current_price = self
            .exchange
            .get_market_price(symbol)
            .await
            .context("failed to fetch market price")?;
        if current_price <= 0.0 {
            anyhow::bail!("market price for {symbol} is not positive");
        }

        // Cross-check the venue price against the independent data source.
        if let Some(source) = &self.market {
            if let Ok(snapshot) = source.snapshot(symbol, &[]).await {
                if snapshot.current_price > 0.0 {
                    let spread =
                        ((current_price - snapshot.current_price) / snapshot.current_price).abs();
                    if spread > MAX_SOURCE_SPREAD {
                        anyhow::bail!(
                            "price sources disagree by {:.2}% (venue {current_price}, data {})",
                            spread * 100.0,
                            snapshot.current_price
                        );
                    }
                }
            }
        }

        let quantity = self
            .exchange
            .format_quantity(symbol, decision.position_size_usd / current_price);
        if quantity <= 0.0 {
            anyhow::bail!("computed quantity rounds to zero at price {current_price}");
        }

        // Margin gate: entry margin plus the taker fee estimate.
        let balance = self.exchange.get_balance().await?;
        let available = balance.get(KEY_AVAILABLE_BALANCE).copied().unwrap_or(0.0);
        let required = decision.position_size_usd / leverage as f64
            + decision.position_size_usd * self.config.taker_fee_rate;
        if required > available {
            anyhow::bail!(
                "insufficient margin: required {:.2}, available {:.2} (short {:.2})",
                required,
                available,
                required - available
            );
        }

        if !valid_stop_loss(side, current_price, decision.stop_loss)
            || !valid_take_profit(side, current_price, decision.take_profit)
        {
            anyhow::bail!(
                "protective prices invalid for {side} at {current_price}: SL {}, TP {}",
                decision.stop_loss,
                decision.take_profit
            );
        }

        // Venue setup is best-effort: the order itself is the authority.
        if let Err(e) = self
            .exchange
            .set_margin_mode(symbol, self.config.is_cross_margin)
            .await
        {
            warn!(symbol, error = %e, "failed to set margin mode");
        }
        if let Err(e) = self.exchange.set_leverage(symbol, leverage).await {
            warn!(symbol, error = %e, "failed to set leverage");
        }

        let placement = self
            .place_open_order(symbol, side, quantity, leverage, current_price)
            .await?;

        self.state
            .write()
            .first_seen
            .insert(key.clone(), chrono::Utc::now().timestamp_millis());

        // The position exists now; protective-order failures must not undo it.
        match self
            .exchange
            .set_stop_loss(symbol, side, quantity, decision.stop_loss)
            .await
        {
            Ok(_) => {
                self.state.write().stop_loss.insert(key.clone(), decision.stop_loss);
            }
            Err(e) => warn!(
                symbol,
                price = decision.stop_loss,
                error = %e,
                "stop-loss placement failed — POSITION HAS NO STOP"
            ),
        }
        match self
            .exchange
            .set_take_profit(symbol, side, quantity, decision.take_profit)
            .await
        {
            Ok(_) => {
                self.state
                    .write()
                    .take_profit
                    .insert(key.clone(), decision.take_profit);
            }
            Err(e) => warn!(
                symbol,
                price = decision.take_profit,
                error = %e,
                "take-profit placement failed"
            ),
        }

        let trade = TradeRecord::new(
            &self.config.id,
            symbol,
            side,
            TradeKind::Open,
            quantity,
            placement.fill_price,
            decision.reasoning.clone(),
        )
        .with_protection(decision.stop_loss, decision.take_profit);
        if let Err(e) = self.store.record_trade(&trade) {
            warn!(error = %e, "failed to persist open trade");
        }

        let conversion_note = match (&placement.converted_to_market, &placement.original_order_id) {
            (true, Some(original)) => {
                format!(" (limit {original} timed out, converted to market)")
            }
            _ => String::new(),
        };
        Ok(format!(
            "opened {side} {symbol} qty {quantity} @ {:.8}{conversion_note}",
            placement.fill_price
        ))
    }

    /// Submit the opening order per the configured order strategy.
    async fn place_open_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        leverage: u32,
        current_price: f64,
    ) -> Result<OpenPlacement> {
        match self.config.order_strategy {
            OrderStrategy::MarketOnly => {
                let ack = match side {
                    PositionSide::Long => self.exchange.open_long(symbol, quantity, leverage).await,
                    PositionSide::Short => {
                        self.exchange.open_short(symbol, quantity, leverage).await
                    }
                }?;
                let fill_price = if ack.avg_price > 0.0 { ack.avg_price } else { current_price };
                Ok(OpenPlacement {
                    order_id: ack.order_id,
                    fill_price,
                    converted_to_market: false,
                    original_order_id: None,
                })
            }

            OrderStrategy::LimitOnly => {
                let price = limit_price(side, current_price, self.config.limit_price_offset_pct);
                let ack = match side {
                    PositionSide::Long => {
                        self.exchange
                            .open_long_limit(symbol, quantity, leverage, price)
                            .await
                    }
                    PositionSide::Short => {
                        self.exchange
                            .open_short_limit(symbol, quantity, leverage, price)
                            .await
                    }
                }?;
                Ok(OpenPlacement {
                    order_id: ack.order_id,
                    fill_price: price,
                    converted_to_market: false,
                    original_order_id: None,
                })
            }

            OrderStrategy::ConservativeHybrid => {
                self.place_hybrid_order(symbol, side, quantity, leverage, current_price)
                    .await
            }
        }
    }

    /// Limit order first; watch it with a 1-second tick; fall back to market
    /// when the timeout expires.
    async fn place_hybrid_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        leverage: u32,
        current_price: f64,
    ) -> Result<OpenPlacement> {
        let price = limit_price(side, current_price, self.config.limit_price_offset_pct);
        let ack = match side {
            PositionSide::Long => {
                self.exchange
                    .open_long_limit(symbol, quantity, leverage, price)
                    .await
            }
            PositionSide::Short => {
                self.exchange
                    .open_short_limit(symbol, quantity, leverage, price)
                    .await
            }
        }?;

        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(self.config.limit_timeout_secs);

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;

            match self.exchange.get_order_status(symbol, &ack.order_id).await {
                Ok(OrderStatus::Filled) => {
                    return Ok(OpenPlacement {
                        order_id: ack.order_id,
                        fill_price: price,
                        converted_to_market: false,
                        original_order_id: None,
                    });
                }
                Ok(OrderStatus::Canceled) => {
                    anyhow::bail!("limit order {} was cancelled externally", ack.order_id)
                }
                Ok(_) => {}
                Err(e) => warn!(symbol, error = %e, "order-status poll failed"),
            }
        }

        // Timed out: cancel the limit, then take the market.
        if let Err(cancel_err) = self.exchange.cancel_order(symbol, &ack.order_id).await {
            // The order may have filled in the race window.
            match self.exchange.get_order_status(symbol, &ack.order_id).await {
                Ok(OrderStatus::Filled) => {
                    return Ok(OpenPlacement {
                        order_id: ack.order_id,
                        fill_price: price,
                        converted_to_market: false,
                        original_order_id: None,
                    });
                }
                _ => {
                    return Err(cancel_err)
                        .context("failed to cancel timed-out limit order");
                }
            }
        }

        info!(
            symbol,
            original_order = %ack.order_id,
            timeout_secs = self.config.limit_timeout_secs,
            "limit order unfilled — converting to market"
        );

        let market_ack = match side {
            PositionSide::Long => self.exchange.open_long(symbol, quantity, leverage).await,
            PositionSide::Short => self.exchange.open_short(symbol, quantity, leverage).await,
        }?;
        let fill_price = if market_ack.avg_price > 0.0 {
            market_ack.avg_price
        } else {
            current_price
        };

        Ok(OpenPlacement {
            order_id: market_ack.order_id,
            fill_price,
            converted_to_market: true,
            original_order_id: Some(ack.order_id),
        })
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    async fn handle_close(&self, decision: &Decision, side: PositionSide) -> Result<String> {
        let symbol = decision.symbol.as_str();
        let key = position_key(symbol, side);

        // Entry price and quantity: the persisted OPEN trade is preferred,
        // the in-memory snapshot is the fallback.
        let (entry_price, quantity) = match self
            .store
            .last_open_trade(&self.config.id, symbol, side)
            .unwrap_or(None)
        {
            Some(open) => open,
            None => self
                .state
                .read()
                .last_positions
                .get(&key)
                .map(|p| (p.entry_price, p.quantity))
                .unwrap_or((0.0, 0.0)),
        };

        let close_price = self
            .exchange
            .get_market_price(symbol)
            .await
            .context("failed to fetch market price")?;

        // quantity = 0 tells the venue to close everything.
        match side {
            PositionSide::Long => self.exchange.close_long(symbol, 0.0).await?,
            PositionSide::Short => self.exchange.close_short(symbol, 0.0).await?,
        };

        // A missing entry makes the P&L unknowable; report 0 rather than
        // guessing.
        let (pnl, pnl_pct) = if entry_price > 0.0 && quantity > 0.0 {
            let pnl = side.sign() * (close_price - entry_price) * quantity;
            (pnl, pnl / (entry_price * quantity) * 100.0)
        } else {
            (0.0, 0.0)
        };

        let trade = TradeRecord::new(
            &self.config.id,
            symbol,
            side,
            TradeKind::Close,
            quantity,
            close_price,
            decision.reasoning.clone(),
        )
        .with_pnl(pnl, pnl_pct);
        if let Err(e) = self.store.record_trade(&trade) {
            warn!(error = %e, "failed to persist close trade");
        }

        self.forget_position(&key);

        Ok(format!(
            "closed {side} {symbol} @ {close_price:.8}, pnl {pnl:.2}"
        ))
    }

    // -------------------------------------------------------------------------
    // Partial close
    // -------------------------------------------------------------------------

    async fn handle_partial_close(&self, decision: &Decision) -> Result<String> {
        let symbol = decision.symbol.as_str();
        let pct = decision.close_percentage;

        if !(pct > 0.0 && pct <= 100.0) {
            anyhow::bail!("close_percentage {pct} outside (0, 100]");
        }

        let position = match self.find_single_position(symbol).await? {
            Some(position) => position,
            None => {
                // Gone between the model's look and ours: the venue already
                // resolved it, which is exactly what the model wanted.
                if self.snapshot_holds_symbol(symbol) {
                    return Ok(format!(
                        "position on {symbol} already closed by the exchange; nothing to do"
                    ));
                }
                anyhow::bail!("no position on {symbol}");
            }
        };

        let side = position.side;
        let key = position_key(symbol, side);
        let total_quantity = position.quantity();
        let mark = self
            .exchange
            .get_market_price(symbol)
            .await
            .context("failed to fetch market price")?;

        let close_quantity = self
            .exchange
            .format_quantity(symbol, total_quantity * pct / 100.0);
        let remaining_quantity = self
            .exchange
            .format_quantity(symbol, total_quantity - close_quantity);
        let remaining_value = remaining_quantity * mark;

        // A dust remainder is worse than no remainder: close it all.
        if remaining_value > 0.0 && remaining_value <= MIN_RESIDUAL_VALUE {
            match side {
                PositionSide::Long => self.exchange.close_long(symbol, 0.0).await?,
                PositionSide::Short => self.exchange.close_short(symbol, 0.0).await?,
            };

            let pnl = side.sign() * (mark - position.entry_price) * total_quantity;
            let trade = TradeRecord::new(
                &self.config.id,
                symbol,
                side,
                TradeKind::Close,
                total_quantity,
                mark,
                format!(
                    "partial close left residual value {remaining_value:.2} <= {MIN_RESIDUAL_VALUE}; closed fully"
                ),
            )
            .with_pnl(pnl, percent_of_notional(pnl, position.entry_price, total_quantity));
            if let Err(e) = self.store.record_trade(&trade) {
                warn!(error = %e, "failed to persist close trade");
            }

            self.forget_position(&key);
            return Ok(format!(
                "residual value {remaining_value:.2} too small — converted to full close"
            ));
        }

        match side {
            PositionSide::Long => self.exchange.close_long(symbol, close_quantity).await?,
            PositionSide::Short => self.exchange.close_short(symbol, close_quantity).await?,
        };

        let pnl = side.sign() * (mark - position.entry_price) * close_quantity;
        let trade = TradeRecord::new(
            &self.config.id,
            symbol,
            side,
            TradeKind::PartialClose,
            close_quantity,
            mark,
            decision.reasoning.clone(),
        )
        .with_pnl(pnl, percent_of_notional(pnl, position.entry_price, close_quantity));
        if let Err(e) = self.store.record_trade(&trade) {
            warn!(error = %e, "failed to persist partial-close trade");
        }

        // The venue dropped the old SL/TP with the quantity change; re-arm
        // protection for the remainder.
        let mut restored = Vec::new();

        if decision.new_stop_loss > 0.0 {
            if valid_stop_loss(side, mark, decision.new_stop_loss) {
                match self
                    .exchange
                    .set_stop_loss(symbol, side, remaining_quantity, decision.new_stop_loss)
                    .await
                {
                    Ok(_) => {
                        self.state
                            .write()
                            .stop_loss
                            .insert(key.clone(), decision.new_stop_loss);
                        restored.push("SL");
                    }
                    Err(e) => warn!(symbol, error = %e, "failed to restore stop-loss"),
                }
            } else {
                warn!(
                    symbol,
                    price = decision.new_stop_loss,
                    "replacement stop-loss on the wrong side of the market — skipped"
                );
            }
        }

        if decision.new_take_profit > 0.0 {
            if valid_take_profit(side, mark, decision.new_take_profit) {
                match self
                    .exchange
                    .set_take_profit(symbol, side, remaining_quantity, decision.new_take_profit)
                    .await
                {
                    Ok(_) => {
                        self.state
                            .write()
                            .take_profit
                            .insert(key.clone(), decision.new_take_profit);
                        restored.push("TP");
                    }
                    Err(e) => warn!(symbol, error = %e, "failed to restore take-profit"),
                }
            } else {
                warn!(
                    symbol,
                    price = decision.new_take_profit,
                    "replacement take-profit on the wrong side of the market — skipped"
                );
            }
        }

        if restored.is_empty() {
            warn!(
                symbol,
                remaining_quantity,
                "REMAINDER UNPROTECTED: no stop-loss or take-profit after partial close"
            );
        }

        Ok(format!(
            "closed {pct}% of {side} {symbol} ({close_quantity} of {total_quantity}), pnl {pnl:.2}, restored [{}]",
            restored.join(", ")
        ))
    }

    // -------------------------------------------------------------------------
    // SL / TP adjustment
    // -------------------------------------------------------------------------

    async fn handle_update_protection(
        &self,
        decision: &Decision,
        kind: Protective,
    ) -> Result<String> {
        let symbol = decision.symbol.as_str();

        let position = match self.find_single_position(symbol).await? {
            Some(position) => position,
            None => {
                if self.snapshot_holds_symbol(symbol) {
                    return Ok(format!(
                        "position on {symbol} already resolved by the exchange; nothing to adjust"
                    ));
                }
                anyhow::bail!("no position on {symbol}");
            }
        };

        let side = position.side;
        let key = position_key(symbol, side);
        let quantity = position.quantity();
        let mark = self
            .exchange
            .get_market_price(symbol)
            .await
            .context("failed to fetch market price")?;

        let new_price = match kind {
            Protective::StopLoss => decision.new_stop_loss,
            Protective::TakeProfit => decision.new_take_profit,
        };

        let valid = match kind {
            Protective::StopLoss => valid_stop_loss(side, mark, new_price),
            Protective::TakeProfit => valid_take_profit(side, mark, new_price),
        };
        if !valid {
            anyhow::bail!(
                "new {} {new_price} on the wrong side of the market ({mark}) for a {side}",
                protective_name(kind)
            );
        }

        // Cancel only the affected group. Skipping the cancel would leave two
        // live protective orders racing each other, so a failed cancel aborts.
        match kind {
            Protective::StopLoss => self
                .exchange
                .cancel_stop_loss_orders(symbol)
                .await
                .context("stop-loss cancel failed; refusing to place a duplicate")?,
            Protective::TakeProfit => self
                .exchange
                .cancel_take_profit_orders(symbol)
                .await
                .context("take-profit cancel failed; refusing to place a duplicate")?,
        };

        match kind {
            Protective::StopLoss => {
                self.exchange
                    .set_stop_loss(symbol, side, quantity, new_price)
                    .await?;
                self.state.write().stop_loss.insert(key.clone(), new_price);
            }
            Protective::TakeProfit => {
                self.exchange
                    .set_take_profit(symbol, side, quantity, new_price)
                    .await?;
                self.state.write().take_profit.insert(key.clone(), new_price);
            }
        }

        // Some venues cancel SL and TP as one group; re-arm the sibling from
        // its recorded price if it is still coherent.
        let mut detail_extra = String::new();
        match kind {
            Protective::StopLoss => {
                let recorded_tp = self.state.read().take_profit.get(&key).copied().unwrap_or(0.0);
                if recorded_tp > 0.0 && valid_take_profit(side, mark, recorded_tp) {
                    let _ = self.exchange.cancel_take_profit_orders(symbol).await;
                    match self
                        .exchange
                        .set_take_profit(symbol, side, quantity, recorded_tp)
                        .await
                    {
                        Ok(_) => detail_extra = format!(", take-profit re-armed @ {recorded_tp}"),
                        Err(e) => {
                            warn!(symbol, error = %e, "failed to re-arm take-profit after SL update")
                        }
                    }
                }
            }
            Protective::TakeProfit => {
                let recorded_sl = self.state.read().stop_loss.get(&key).copied().unwrap_or(0.0);
                if recorded_sl > 0.0 && valid_stop_loss(side, mark, recorded_sl) {
                    let _ = self.exchange.cancel_stop_loss_orders(symbol).await;
                    match self
                        .exchange
                        .set_stop_loss(symbol, side, quantity, recorded_sl)
                        .await
                    {
                        Ok(_) => detail_extra = format!(", stop-loss re-armed @ {recorded_sl}"),
                        Err(e) => {
                            warn!(symbol, error = %e, "failed to re-arm stop-loss after TP update")
                        }
                    }
                }
            }
        }

        Ok(format!(
            "{} moved to {new_price} on {side} {symbol}{detail_extra}",
            protective_name(kind)
        ))
    }

    // -------------------------------------------------------------------------
    // Lookup helpers
    // -------------------------------------------------------------------------

    /// The single live position on `symbol`, if any. Two positions (hedged
    /// long + short) make the symbol-only actions ambiguous.
    async fn find_single_position(&self, symbol: &str) -> Result<Option<VenuePosition>> {
        let positions = self.exchange.get_positions().await?;
        let mut matching: Vec<VenuePosition> = positions
            .into_iter()
            .filter(|p| p.symbol == symbol && p.quantity() > 0.0)
            .collect();

        match matching.len() {
            0 => Ok(None),
            1 => Ok(Some(matching.remove(0))),
            _ => anyhow::bail!(
                "both long and short positions exist on {symbol}; cannot infer the target"
            ),
        }
    }

    fn snapshot_holds_symbol(&self, symbol: &str) -> bool {
        self.state
            .read()
            .last_positions
            .values()
            .any(|p| p.symbol == symbol)
    }

    /// Drop all bookkeeping for a position the engine just closed.
    pub(crate) fn forget_position(&self, key: &str) {
        let mut state = self.state.write();
        state.first_seen.remove(key);
        state.stop_loss.remove(key);
        state.take_profit.remove(key);
        state.last_positions.remove(key);
        self.peak_pnl.write().remove(key);
    }
}

fn protective_name(kind: Protective) -> &'static str {
    match kind {
        Protective::StopLoss => "stop-loss",
        Protective::TakeProfit => "take-profit",
    }
}

fn limit_price(side: PositionSide, current_price: f64, offset_pct: f64) -> f64 {
    match side {
        PositionSide::Long => current_price * (1.0 + offset_pct / 100.0),
        PositionSide::Short => current_price * (1.0 - offset_pct / 100.0),
    }
}

fn percent_of_notional(pnl: f64, entry_price: f64, quantity: f64) -> f64 {
    let notional = entry_price * quantity;
    if notional > 0.0 {
        pnl / notional * 100.0
    } else {
        0.0
    }
}
