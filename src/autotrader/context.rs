// =============================================================================
// Context Assembly — everything the model sees for one cycle
// =============================================================================
//
// Gathers the account block, enriched live positions, the candidate-coin
// universe, resting orders, market snapshots, and recent performance into a
// single serialisable structure. Position bookkeeping happens here too:
// first-seen stamps are created on first sighting, and bookkeeping for
// positions that vanished from exchange truth is deleted (with any orphaned
// protective orders cancelled on a best-effort basis).
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::balance::extract_total_equity;
use crate::coins::{resolve_candidates, CandidateCoin};
use crate::exchange::{
    OpenOrder, KEY_AVAILABLE_BALANCE, KEY_TOTAL_UNREALIZED_PROFIT, KEY_TOTAL_WALLET_BALANCE,
};
use crate::market::MarketSnapshot;
use crate::persistence::PerformanceSummary;
use crate::types::PositionState;

use super::AutoTrader;

/// How many recent closed trades feed the performance summary.
const PERFORMANCE_WINDOW: usize = 20;

// ---------------------------------------------------------------------------
// Context shapes
// ---------------------------------------------------------------------------

/// Account-level block of the trading context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountContext {
    pub total_wallet_balance: f64,
    pub total_unrealized_profit: f64,
    pub available_balance: f64,
    /// Wallet + unrealised where available (see the extraction fallback).
    pub total_equity: f64,
    /// Sum of `quantity * entry / leverage` across live positions.
    pub total_margin_used: f64,
    pub initial_balance: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
}

/// The full per-cycle context handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingContext {
    pub trader_id: String,
    pub trader_name: String,
    pub timestamp: String,
    pub account: AccountContext,
    pub positions: Vec<PositionState>,
    pub candidates: Vec<CandidateCoin>,
    /// Resting orders, so the model avoids duplicate placements.
    pub open_orders: Vec<OpenOrder>,
    /// Market snapshots keyed by symbol (candidates and held positions).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub market: HashMap<String, MarketSnapshot>,
    pub performance: PerformanceSummary,
    /// Leverage hints forwarded from configuration.
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

impl AutoTrader {
    /// Assemble this cycle's trading context from venue truth.
    pub(crate) async fn build_context(&self) -> Result<TradingContext> {
        let balance = self
            .exchange
            .get_balance()
            .await
            .context("context: failed to fetch balance")?;
        let venue_positions = self
            .exchange
            .get_positions()
            .await
            .context("context: failed to fetch positions")?;

        // ── Account block ───────────────────────────────────────────────
        let wallet = balance.get(KEY_TOTAL_WALLET_BALANCE).copied().unwrap_or(0.0);
        let unrealized = balance
            .get(KEY_TOTAL_UNREALIZED_PROFIT)
            .copied()
            .unwrap_or(0.0);
        let available = balance.get(KEY_AVAILABLE_BALANCE).copied().unwrap_or(0.0);
        let total_equity = extract_total_equity(&balance).equity;

        // ── Positions (ghosts filtered, bookkeeping refreshed) ──────────
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut positions: Vec<PositionState> = Vec::new();
        let mut total_margin_used = 0.0;

        {
            let mut state = self.state.write();
            let peak_cache = self.peak_pnl.read();

            for vp in venue_positions.iter().filter(|p| p.quantity() != 0.0) {
                let quantity = vp.quantity();
                let key = crate::types::position_key(&vp.symbol, vp.side);
                let margin = quantity * vp.entry_price / vp.leverage.max(1) as f64;
                total_margin_used += margin;

                let first_seen = *state.first_seen.entry(key.clone()).or_insert(now_ms);
                let pnl_pct = if margin > 0.0 {
                    vp.unrealized_profit / margin * 100.0
                } else {
                    0.0
                };

                positions.push(PositionState {
                    symbol: vp.symbol.clone(),
                    side: vp.side,
                    quantity,
                    entry_price: vp.entry_price,
                    mark_price: vp.mark_price,
                    leverage: vp.leverage,
                    unrealized_pnl: vp.unrealized_profit,
                    unrealized_pnl_pct: pnl_pct,
                    peak_pnl_pct: peak_cache.get(&key).copied().unwrap_or(0.0),
                    liquidation_price: vp.liquidation_price,
                    margin_used: margin,
                    first_seen_ms: first_seen,
                    stop_loss: state.stop_loss.get(&key).copied().unwrap_or(0.0),
                    take_profit: state.take_profit.get(&key).copied().unwrap_or(0.0),
                });
            }
        }

        // ── Bookkeeping cleanup for vanished positions ──────────────────
        let live_keys: HashSet<String> = positions.iter().map(|p| p.key()).collect();
        let live_symbols: HashSet<String> = positions.iter().map(|p| p.symbol.clone()).collect();
        let orphaned_symbols = self.clear_vanished_bookkeeping(&live_keys, &live_symbols);

        for symbol in orphaned_symbols {
            // The position is gone; any protective order left on the symbol
            // is an orphan that could fire into a fresh position later.
            if let Err(e) = self.exchange.cancel_stop_loss_orders(&symbol).await {
                warn!(symbol = %symbol, error = %e, "failed to cancel orphaned stop-loss orders");
            }
            if let Err(e) = self.exchange.cancel_take_profit_orders(&symbol).await {
                warn!(symbol = %symbol, error = %e, "failed to cancel orphaned take-profit orders");
            }
        }

        // ── Candidate coins ─────────────────────────────────────────────
        let candidates = resolve_candidates(&self.config, self.candidates.as_ref()).await;

        // ── Open orders, fetched once per cycle ─────────────────────────
        let mut order_symbols: Vec<String> = live_symbols.iter().cloned().collect();
        for candidate in &candidates {
            if !order_symbols.contains(&candidate.symbol) {
                order_symbols.push(candidate.symbol.clone());
            }
        }

        let mut open_orders = Vec::new();
        for symbol in &order_symbols {
            match self.exchange.get_open_orders(symbol).await {
                Ok(mut orders) => open_orders.append(&mut orders),
                Err(e) => warn!(symbol = %symbol, error = %e, "failed to fetch open orders"),
            }
        }

        // ── Market snapshots ────────────────────────────────────────────
        let mut market = HashMap::new();
        if let Some(source) = &self.market {
            for symbol in &order_symbols {
                match source.snapshot(symbol, &self.config.timeframes).await {
                    Ok(snapshot) => {
                        market.insert(symbol.clone(), snapshot);
                    }
                    Err(e) => warn!(symbol = %symbol, error = %e, "market snapshot unavailable"),
                }
            }
        }

        // ── Recent performance ──────────────────────────────────────────
        let performance = self
            .store
            .analyze_performance(&self.config.id, PERFORMANCE_WINDOW)
            .unwrap_or_else(|e| {
                warn!(error = %e, "performance summary unavailable");
                PerformanceSummary::default()
            });

        let total_pnl = total_equity - self.config.initial_balance;
        let total_pnl_pct = total_pnl / self.config.initial_balance * 100.0;

        debug!(
            positions = positions.len(),
            candidates = candidates.len(),
            open_orders = open_orders.len(),
            total_equity,
            "trading context assembled"
        );

        Ok(TradingContext {
            trader_id: self.config.id.clone(),
            trader_name: self.config.name.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            account: AccountContext {
                total_wallet_balance: wallet,
                total_unrealized_profit: unrealized,
                available_balance: available,
                total_equity,
                total_margin_used,
                initial_balance: self.config.initial_balance,
                total_pnl,
                total_pnl_pct,
            },
            positions,
            candidates,
            open_orders,
            market,
            performance,
            btc_eth_leverage: self.config.btc_eth_leverage,
            altcoin_leverage: self.config.altcoin_leverage,
        })
    }

    /// Drop first-seen / SL / TP / peak entries whose position is gone.
    /// Returns the symbols that no longer have any position at all.
    fn clear_vanished_bookkeeping(
        &self,
        live_keys: &HashSet<String>,
        live_symbols: &HashSet<String>,
    ) -> Vec<String> {
        let mut state = self.state.write();

        let mut vanished: Vec<String> = state
            .first_seen
            .keys()
            .chain(state.stop_loss.keys())
            .chain(state.take_profit.keys())
            .filter(|key| !live_keys.contains(*key))
            .cloned()
            .collect();
        vanished.sort();
        vanished.dedup();

        let mut orphaned_symbols = Vec::new();
        for key in &vanished {
            state.first_seen.remove(key);
            state.stop_loss.remove(key);
            state.take_profit.remove(key);
            self.peak_pnl.write().remove(key);

            // "<symbol>_<side>"
            if let Some(symbol) = key.rsplit_once('_').map(|(s, _)| s.to_string()) {
                if !live_symbols.contains(&symbol) && !orphaned_symbols.contains(&symbol) {
                    orphaned_symbols.push(symbol);
                }
            }
        }

        orphaned_symbols
    }
}
