// =============================================================================
// Venue Adapter Contract — the capability every exchange integration satisfies
// =============================================================================
//
// The core engine never talks to a venue directly; it sees this trait.
// Adapters own the venue-specific rules (symbol precision, minimum notional,
// dual-side position mode, request signing) and convert every payload to the
// canonical forms below before it crosses this boundary.
//
// CONVENTION: `quantity = 0.0` passed to `close_long` / `close_short` means
// "close the entire position". The engine relies on this for full closes and
// emergency closes; every adapter must honour it.
// =============================================================================

pub mod cache;
pub mod paper;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::PositionSide;

// ---------------------------------------------------------------------------
// Canonical payloads
// ---------------------------------------------------------------------------

/// Canonical balance payload: a flat map of numeric fields.
///
/// Adapters populate the keys below where the venue provides them; the
/// fallback behaviour over missing keys is encoded once in
/// [`crate::balance::extract_total_equity`].
pub type BalanceMap = HashMap<String, f64>;

pub const KEY_TOTAL_WALLET_BALANCE: &str = "totalWalletBalance";
pub const KEY_AVAILABLE_BALANCE: &str = "availableBalance";
pub const KEY_TOTAL_UNREALIZED_PROFIT: &str = "totalUnrealizedProfit";
pub const KEY_BALANCE: &str = "balance";

/// Canonical position payload from a venue.
///
/// `position_amt` is the raw signed amount (negative for shorts); the engine
/// derives magnitude and side from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Signed raw amount as reported by the venue.
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_profit: f64,
    #[serde(default)]
    pub liquidation_price: f64,
}

impl VenuePosition {
    /// Positive quantity magnitude.
    pub fn quantity(&self) -> f64 {
        self.position_amt.abs()
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    /// Average fill price when the venue reports one immediately.
    #[serde(default)]
    pub avg_price: f64,
}

/// Lifecycle state of a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
}

/// An order resting on the venue (limit entries and protective orders).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: PositionSide,
    /// "LIMIT", "MARKET", "STOP", "TAKE_PROFIT".
    pub order_type: String,
    pub price: f64,
    pub quantity: f64,
    /// True for protective orders that only reduce a position.
    #[serde(default)]
    pub reduce_only: bool,
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// Unified venue capability. All methods are blocking I/O from the caller's
/// perspective; the cycle serialises through them.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Canonical balance map (see the `KEY_*` constants).
    async fn get_balance(&self) -> Result<BalanceMap>;

    /// All live positions in canonical form.
    async fn get_positions(&self) -> Result<Vec<VenuePosition>>;

    /// Open a long with a market order.
    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck>;

    /// Open a short with a market order.
    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck>;

    /// Open a long with a resting limit order at `price`.
    async fn open_long_limit(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderAck>;

    /// Open a short with a resting limit order at `price`.
    async fn open_short_limit(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderAck>;

    /// Close (part of) a long. `quantity = 0.0` closes the whole position.
    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck>;

    /// Close (part of) a short. `quantity = 0.0` closes the whole position.
    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Cross margin when `is_cross`, isolated otherwise.
    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<()>;

    async fn get_market_price(&self, symbol: &str) -> Result<f64>;

    /// Place a stop-loss for `quantity` of the `side` position at `price`.
    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck>;

    /// Place a take-profit for `quantity` of the `side` position at `price`.
    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck>;

    /// Cancel every stop-loss order on `symbol`.
    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<()>;

    /// Cancel every take-profit order on `symbol`.
    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<()>;

    /// Cancel every open order on `symbol`, protective or not.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    /// Cancel one specific order.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    /// Current status of one order. Used by the hybrid open-order watcher.
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus>;

    /// Round `quantity` to the venue's precision rules for `symbol`.
    fn format_quantity(&self, symbol: &str, quantity: f64) -> f64;

    /// All resting orders on `symbol`.
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>>;
}

// Shared adapters (e.g. one paper venue feeding both the caching layer and a
// price-sync task) pass through untouched.
#[async_trait]
impl<E: Exchange + ?Sized> Exchange for std::sync::Arc<E> {
    async fn get_balance(&self) -> Result<BalanceMap> {
        (**self).get_balance().await
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
        (**self).get_positions().await
    }

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        (**self).open_long(symbol, quantity, leverage).await
    }

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        (**self).open_short(symbol, quantity, leverage).await
    }

    async fn open_long_limit(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderAck> {
        (**self).open_long_limit(symbol, quantity, leverage, price).await
    }

    async fn open_short_limit(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderAck> {
        (**self).open_short_limit(symbol, quantity, leverage, price).await
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        (**self).close_long(symbol, quantity).await
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        (**self).close_short(symbol, quantity).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        (**self).set_leverage(symbol, leverage).await
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<()> {
        (**self).set_margin_mode(symbol, is_cross).await
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64> {
        (**self).get_market_price(symbol).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck> {
        (**self).set_stop_loss(symbol, side, quantity, price).await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck> {
        (**self).set_take_profit(symbol, side, quantity, price).await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<()> {
        (**self).cancel_stop_loss_orders(symbol).await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<()> {
        (**self).cancel_take_profit_orders(symbol).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        (**self).cancel_all_orders(symbol).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        (**self).cancel_order(symbol, order_id).await
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus> {
        (**self).get_order_status(symbol, order_id).await
    }

    fn format_quantity(&self, symbol: &str, quantity: f64) -> f64 {
        (**self).format_quantity(symbol, quantity)
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        (**self).get_open_orders(symbol).await
    }
}
