// =============================================================================
// Paper Exchange — in-memory venue for demo mode and tests
// =============================================================================
//
// Implements the full adapter contract against a simulated account: market
// and limit opens, closes with the `qty=0 ⇒ close all` convention, stop-loss
// and take-profit order records with group cancels, and order-status queries.
//
// Exchange-realistic behaviours the engine depends on are reproduced here:
//   - protective orders are cancelled by the venue after any close, because
//     their quantity no longer matches the position;
//   - protective orders that would trigger immediately are rejected;
//   - orders below the 10-unit minimum notional are rejected.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::PositionSide;

use super::{
    BalanceMap, Exchange, OpenOrder, OrderAck, OrderStatus, VenuePosition, KEY_AVAILABLE_BALANCE,
    KEY_TOTAL_UNREALIZED_PROFIT, KEY_TOTAL_WALLET_BALANCE,
};

/// Minimum order value in quote units, as enforced by real venues.
const MIN_NOTIONAL: f64 = 10.0;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PaperPosition {
    symbol: String,
    side: PositionSide,
    quantity: f64,
    entry_price: f64,
    leverage: u32,
}

impl PaperPosition {
    fn pnl(&self, mark: f64) -> f64 {
        self.side.sign() * (mark - self.entry_price) * self.quantity
    }

    fn margin(&self) -> f64 {
        self.quantity * self.entry_price / self.leverage.max(1) as f64
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    symbol: String,
    side: PositionSide,
    /// "LIMIT", "STOP", or "TAKE_PROFIT".
    order_type: String,
    price: f64,
    quantity: f64,
    status: OrderStatus,
    reduce_only: bool,
    /// Leverage carried by resting entry orders so a later fill can open the
    /// position correctly.
    leverage: u32,
}

struct PaperState {
    wallet: f64,
    marks: HashMap<String, f64>,
    positions: HashMap<String, PaperPosition>,
    orders: HashMap<String, PaperOrder>,
}

// ---------------------------------------------------------------------------
// PaperExchange
// ---------------------------------------------------------------------------

/// Simulated venue. Thread-safe; shared between the main loop and the
/// drawdown monitor exactly like a real adapter.
pub struct PaperExchange {
    state: RwLock<PaperState>,
}

impl PaperExchange {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            state: RwLock::new(PaperState {
                wallet: initial_balance,
                marks: HashMap::new(),
                positions: HashMap::new(),
                orders: HashMap::new(),
            }),
        }
    }

    /// Construct with pre-seeded mark prices.
    pub fn with_prices(initial_balance: f64, prices: &[(&str, f64)]) -> Self {
        let venue = Self::new(initial_balance);
        for (symbol, price) in prices {
            venue.set_mark_price(symbol, *price);
        }
        venue
    }

    /// Set or move the mark price for `symbol`.
    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.state.write().marks.insert(symbol.to_string(), price);
    }

    /// Fill a resting limit order immediately (test hook standing in for the
    /// matching engine).
    pub fn fill_order(&self, order_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("paper: unknown order {order_id}"))?;
        if order.status != OrderStatus::New {
            anyhow::bail!("paper: order {order_id} is not open");
        }
        Self::apply_entry_fill(&mut state, &order);
        if let Some(resting) = state.orders.get_mut(order_id) {
            resting.status = OrderStatus::Filled;
        }
        Ok(())
    }

    /// Count resting protective orders of `order_type` on `symbol`.
    pub fn protective_orders(&self, symbol: &str, order_type: &str) -> Vec<(f64, f64)> {
        self.state
            .read()
            .orders
            .values()
            .filter(|o| {
                o.symbol == symbol && o.order_type == order_type && o.status == OrderStatus::New
            })
            .map(|o| (o.price, o.quantity))
            .collect()
    }

    fn mark_of(state: &PaperState, symbol: &str) -> Result<f64> {
        state
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("paper: no mark price for {symbol}"))
    }

    fn margin_in_use(state: &PaperState) -> f64 {
        state.positions.values().map(|p| p.margin()).sum()
    }

    fn apply_entry_fill(state: &mut PaperState, order: &PaperOrder) {
        let key = crate::types::position_key(&order.symbol, order.side);
        let entry = state
            .positions
            .entry(key)
            .or_insert_with(|| PaperPosition {
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: 0.0,
                entry_price: 0.0,
                leverage: order.leverage,
            });

        // Average the entry price across fills.
        let old_notional = entry.quantity * entry.entry_price;
        let add_notional = order.quantity * order.price;
        entry.quantity += order.quantity;
        if entry.quantity > 0.0 {
            entry.entry_price = (old_notional + add_notional) / entry.quantity;
        }
        entry.leverage = order.leverage;
    }

    fn submit_entry(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        leverage: u32,
        limit_price: Option<f64>,
    ) -> Result<OrderAck> {
        let mut state = self.state.write();
        let mark = Self::mark_of(&state, symbol)?;
        let price = limit_price.unwrap_or(mark);

        if quantity * price < MIN_NOTIONAL {
            anyhow::bail!(
                "paper: order notional {:.2} below minimum {MIN_NOTIONAL}",
                quantity * price
            );
        }

        let required = quantity * price / leverage.max(1) as f64;
        let available = state.wallet - Self::margin_in_use(&state);
        if required > available {
            anyhow::bail!(
                "paper: insufficient margin (required {:.2}, available {:.2})",
                required,
                available
            );
        }

        let order = PaperOrder {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: if limit_price.is_some() { "LIMIT" } else { "MARKET" }.to_string(),
            price,
            quantity,
            status: OrderStatus::New,
            reduce_only: false,
            leverage,
        };

        let ack = OrderAck {
            order_id: order.order_id.clone(),
            avg_price: price,
        };

        if limit_price.is_some() {
            // Rests on the book until filled or cancelled.
            state.orders.insert(order.order_id.clone(), order);
            debug!(symbol, side = %side, quantity, price, "paper limit order resting");
        } else {
            Self::apply_entry_fill(&mut state, &order);
            let mut filled = order;
            filled.status = OrderStatus::Filled;
            state.orders.insert(filled.order_id.clone(), filled);
            info!(symbol, side = %side, quantity, price, "paper market fill");
        }

        Ok(ack)
    }

    fn submit_close(&self, symbol: &str, side: PositionSide, quantity: f64) -> Result<OrderAck> {
        let mut state = self.state.write();
        let mark = Self::mark_of(&state, symbol)?;
        let key = crate::types::position_key(symbol, side);

        let position = state
            .positions
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("paper: no {side} position on {symbol}"))?;

        let close_qty = if quantity <= 0.0 {
            position.quantity
        } else {
            quantity.min(position.quantity)
        };

        let realized = position.side.sign() * (mark - position.entry_price) * close_qty;
        state.wallet += realized;

        if close_qty >= position.quantity {
            state.positions.remove(&key);
        } else if let Some(p) = state.positions.get_mut(&key) {
            p.quantity -= close_qty;
        }

        // Real venues drop protective orders once the quantity they cover no
        // longer matches the position.
        for order in state.orders.values_mut() {
            if order.symbol == symbol
                && order.status == OrderStatus::New
                && (order.order_type == "STOP" || order.order_type == "TAKE_PROFIT")
            {
                order.status = OrderStatus::Canceled;
            }
        }

        info!(
            symbol,
            side = %side,
            close_qty,
            realized,
            "paper close fill"
        );

        Ok(OrderAck {
            order_id: Uuid::new_v4().to_string(),
            avg_price: mark,
        })
    }

    fn submit_protective(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
        order_type: &str,
    ) -> Result<OrderAck> {
        let mut state = self.state.write();
        let mark = Self::mark_of(&state, symbol)?;

        // Immediate-trigger rejection, matching venue behaviour.
        let would_trigger = match (order_type, side) {
            ("STOP", PositionSide::Long) => price >= mark,
            ("STOP", PositionSide::Short) => price <= mark,
            ("TAKE_PROFIT", PositionSide::Long) => price <= mark,
            ("TAKE_PROFIT", PositionSide::Short) => price >= mark,
            _ => false,
        };
        if would_trigger {
            anyhow::bail!(
                "paper: {order_type} at {price} would trigger immediately (mark {mark})"
            );
        }

        let order = PaperOrder {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: order_type.to_string(),
            price,
            quantity,
            status: OrderStatus::New,
            reduce_only: true,
            leverage: 0,
        };
        let ack = OrderAck {
            order_id: order.order_id.clone(),
            avg_price: 0.0,
        };
        state.orders.insert(order.order_id.clone(), order);
        Ok(ack)
    }

    fn cancel_by_type(&self, symbol: &str, order_type: &str) {
        let mut state = self.state.write();
        for order in state.orders.values_mut() {
            if order.symbol == symbol
                && order.order_type == order_type
                && order.status == OrderStatus::New
            {
                order.status = OrderStatus::Canceled;
            }
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_balance(&self) -> Result<BalanceMap> {
        let state = self.state.read();
        let unrealized: f64 = state
            .positions
            .values()
            .filter_map(|p| state.marks.get(&p.symbol).map(|m| p.pnl(*m)))
            .sum();

        let mut map = BalanceMap::new();
        map.insert(KEY_TOTAL_WALLET_BALANCE.to_string(), state.wallet);
        map.insert(KEY_TOTAL_UNREALIZED_PROFIT.to_string(), unrealized);
        map.insert(
            KEY_AVAILABLE_BALANCE.to_string(),
            state.wallet - Self::margin_in_use(&state),
        );
        Ok(map)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
        let state = self.state.read();
        let mut out = Vec::with_capacity(state.positions.len());
        for position in state.positions.values() {
            let mark = state
                .marks
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.entry_price);

            // Rough cross-margin liquidation estimate: full adverse move of
            // 1/leverage from entry.
            let lev = position.leverage.max(1) as f64;
            let liquidation_price = match position.side {
                PositionSide::Long => position.entry_price * (1.0 - 1.0 / lev),
                PositionSide::Short => position.entry_price * (1.0 + 1.0 / lev),
            };

            out.push(VenuePosition {
                symbol: position.symbol.clone(),
                side: position.side,
                position_amt: position.side.sign() * position.quantity,
                entry_price: position.entry_price,
                mark_price: mark,
                leverage: position.leverage,
                unrealized_profit: position.pnl(mark),
                liquidation_price,
            });
        }
        Ok(out)
    }

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        self.submit_entry(symbol, PositionSide::Long, quantity, leverage, None)
    }

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        self.submit_entry(symbol, PositionSide::Short, quantity, leverage, None)
    }

    async fn open_long_limit(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderAck> {
        self.submit_entry(symbol, PositionSide::Long, quantity, leverage, Some(price))
    }

    async fn open_short_limit(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderAck> {
        self.submit_entry(symbol, PositionSide::Short, quantity, leverage, Some(price))
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        self.submit_close(symbol, PositionSide::Long, quantity)
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        self.submit_close(symbol, PositionSide::Short, quantity)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let mut state = self.state.write();
        for position in state.positions.values_mut() {
            if position.symbol == symbol {
                position.leverage = leverage;
            }
        }
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _is_cross: bool) -> Result<()> {
        // The paper account is always cross-margined.
        Ok(())
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64> {
        Self::mark_of(&self.state.read(), symbol)
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck> {
        self.submit_protective(symbol, side, quantity, price, "STOP")
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck> {
        self.submit_protective(symbol, side, quantity, price, "TAKE_PROFIT")
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<()> {
        self.cancel_by_type(symbol, "STOP");
        Ok(())
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<()> {
        self.cancel_by_type(symbol, "TAKE_PROFIT");
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let mut state = self.state.write();
        for order in state.orders.values_mut() {
            if order.symbol == symbol && order.status == OrderStatus::New {
                order.status = OrderStatus::Canceled;
            }
        }
        Ok(())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.orders.get_mut(order_id) {
            Some(order) if order.symbol == symbol && order.status == OrderStatus::New => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => anyhow::bail!("paper: order {order_id} is not open"),
            None => anyhow::bail!("paper: unknown order {order_id}"),
        }
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> Result<OrderStatus> {
        self.state
            .read()
            .orders
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| anyhow::anyhow!("paper: unknown order {order_id}"))
    }

    fn format_quantity(&self, _symbol: &str, quantity: f64) -> f64 {
        // Six decimal places covers every major perp contract step.
        (quantity * 1e6).round() / 1e6
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let state = self.state.read();
        Ok(state
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status == OrderStatus::New)
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                symbol: o.symbol.clone(),
                side: o.side,
                order_type: o.order_type.clone(),
                price: o.price,
                quantity: o.quantity,
                reduce_only: o.reduce_only,
            })
            .collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::extract_total_equity;

    #[tokio::test]
    async fn market_open_creates_position_and_locks_margin() {
        let venue = PaperExchange::with_prices(1000.0, &[("BTCUSDT", 50000.0)]);

        venue.open_long("BTCUSDT", 0.01, 10).await.unwrap();

        let positions = venue.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].quantity(), 0.01);
        assert_eq!(positions[0].entry_price, 50000.0);

        let balance = venue.get_balance().await.unwrap();
        // 0.01 * 50000 / 10 = 50 margin locked.
        assert!((balance[KEY_AVAILABLE_BALANCE] - 950.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn close_all_with_zero_quantity_realises_pnl() {
        let venue = PaperExchange::with_prices(1000.0, &[("ETHUSDT", 3000.0)]);
        venue.open_long("ETHUSDT", 1.0, 10).await.unwrap();

        venue.set_mark_price("ETHUSDT", 3100.0);
        venue.close_long("ETHUSDT", 0.0).await.unwrap();

        assert!(venue.get_positions().await.unwrap().is_empty());
        let balance = venue.get_balance().await.unwrap();
        let equity = extract_total_equity(&balance);
        assert!((equity.equity - 1100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn partial_close_cancels_protective_orders() {
        let venue = PaperExchange::with_prices(10000.0, &[("ETHUSDT", 3100.0)]);
        venue.open_long("ETHUSDT", 2.0, 10).await.unwrap();
        venue
            .set_stop_loss("ETHUSDT", PositionSide::Long, 2.0, 2900.0)
            .await
            .unwrap();
        venue
            .set_take_profit("ETHUSDT", PositionSide::Long, 2.0, 3300.0)
            .await
            .unwrap();

        venue.close_long("ETHUSDT", 1.0).await.unwrap();

        assert!(venue.protective_orders("ETHUSDT", "STOP").is_empty());
        assert!(venue.protective_orders("ETHUSDT", "TAKE_PROFIT").is_empty());
        let positions = venue.get_positions().await.unwrap();
        assert_eq!(positions[0].quantity(), 1.0);
    }

    #[tokio::test]
    async fn immediate_trigger_protective_rejected() {
        let venue = PaperExchange::with_prices(1000.0, &[("BTCUSDT", 50000.0)]);
        venue.open_long("BTCUSDT", 0.01, 10).await.unwrap();

        // SL above mark for a long would fire instantly.
        assert!(venue
            .set_stop_loss("BTCUSDT", PositionSide::Long, 0.01, 51000.0)
            .await
            .is_err());
        // TP below mark likewise.
        assert!(venue
            .set_take_profit("BTCUSDT", PositionSide::Long, 0.01, 49000.0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn min_notional_enforced() {
        let venue = PaperExchange::with_prices(1000.0, &[("DOGEUSDT", 0.1)]);
        let err = venue.open_long("DOGEUSDT", 50.0, 5).await;
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("minimum"));
    }

    #[tokio::test]
    async fn insufficient_margin_rejected() {
        let venue = PaperExchange::with_prices(100.0, &[("BTCUSDT", 50000.0)]);
        // 0.1 * 50000 / 10 = 500 margin on a 100 balance.
        assert!(venue.open_long("BTCUSDT", 0.1, 10).await.is_err());
    }

    #[tokio::test]
    async fn limit_order_rests_until_filled() {
        let venue = PaperExchange::with_prices(10000.0, &[("BTCUSDT", 50000.0)]);
        let ack = venue
            .open_long_limit("BTCUSDT", 0.01, 10, 49500.0)
            .await
            .unwrap();

        assert_eq!(
            venue.get_order_status("BTCUSDT", &ack.order_id).await.unwrap(),
            OrderStatus::New
        );
        assert!(venue.get_positions().await.unwrap().is_empty());

        venue.fill_order(&ack.order_id).unwrap();
        assert_eq!(
            venue.get_order_status("BTCUSDT", &ack.order_id).await.unwrap(),
            OrderStatus::Filled
        );
        let positions = venue.get_positions().await.unwrap();
        assert_eq!(positions[0].entry_price, 49500.0);
    }

    #[tokio::test]
    async fn cancel_groups_are_independent() {
        let venue = PaperExchange::with_prices(10000.0, &[("ETHUSDT", 3000.0)]);
        venue.open_long("ETHUSDT", 1.0, 10).await.unwrap();
        venue
            .set_stop_loss("ETHUSDT", PositionSide::Long, 1.0, 2900.0)
            .await
            .unwrap();
        venue
            .set_take_profit("ETHUSDT", PositionSide::Long, 1.0, 3300.0)
            .await
            .unwrap();

        venue.cancel_stop_loss_orders("ETHUSDT").await.unwrap();
        assert!(venue.protective_orders("ETHUSDT", "STOP").is_empty());
        assert_eq!(venue.protective_orders("ETHUSDT", "TAKE_PROFIT").len(), 1);
    }

    #[test]
    fn quantity_formatting_rounds() {
        let venue = PaperExchange::new(0.0);
        assert_eq!(venue.format_quantity("BTCUSDT", 0.0100000049), 0.01);
    }
}
