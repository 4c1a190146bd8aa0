// =============================================================================
// Venue caching layer — TTL caches with synchronous invalidation on mutation
// =============================================================================
//
// Balance and positions are the two hot reads: the main loop and the drawdown
// monitor both poll them. Both are cached for a short TTL, and any operation
// that mutates funds or positions invalidates the affected caches *before*
// the call returns, so a read issued immediately after an order always hits
// the venue.
//
// Invalidation matrix:
//   open / close orders            -> balance + positions
//   SL / TP placement and cancels  -> positions only
//   leverage / margin-mode changes -> positions only
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::types::PositionSide;

use super::{BalanceMap, Exchange, OpenOrder, OrderAck, OrderStatus, VenuePosition};

/// Default cache lifetime for balance and positions.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

/// A single-slot cache: a value plus the instant it was stored.
///
/// Read-shared, write-exclusive: concurrent readers are admitted while
/// invalidations serialise.
pub struct TtlCache<T> {
    ttl: Duration,
    slot: RwLock<Option<(Instant, T)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    /// The cached value, unless empty or older than the TTL.
    pub fn get(&self) -> Option<T> {
        let slot = self.slot.read();
        match slot.as_ref() {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&self, value: T) {
        *self.slot.write() = Some((Instant::now(), value));
    }

    pub fn invalidate(&self) {
        *self.slot.write() = None;
    }
}

// ---------------------------------------------------------------------------
// CachedExchange
// ---------------------------------------------------------------------------

/// Decorator adding the per-type TTL caches to any venue adapter.
pub struct CachedExchange<E> {
    inner: E,
    balance: TtlCache<BalanceMap>,
    positions: TtlCache<Vec<VenuePosition>>,
}

impl<E: Exchange> CachedExchange<E> {
    pub fn new(inner: E) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(inner: E, ttl: Duration) -> Self {
        Self {
            inner,
            balance: TtlCache::new(ttl),
            positions: TtlCache::new(ttl),
        }
    }

    fn invalidate_funds_and_positions(&self) {
        self.balance.invalidate();
        self.positions.invalidate();
    }

    fn invalidate_positions(&self) {
        self.positions.invalidate();
    }
}

#[async_trait]
impl<E: Exchange> Exchange for CachedExchange<E> {
    async fn get_balance(&self) -> Result<BalanceMap> {
        if let Some(cached) = self.balance.get() {
            debug!("balance served from cache");
            return Ok(cached);
        }
        let fresh = self.inner.get_balance().await?;
        self.balance.put(fresh.clone());
        Ok(fresh)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
        if let Some(cached) = self.positions.get() {
            debug!("positions served from cache");
            return Ok(cached);
        }
        let fresh = self.inner.get_positions().await?;
        self.positions.put(fresh.clone());
        Ok(fresh)
    }

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        let result = self.inner.open_long(symbol, quantity, leverage).await;
        self.invalidate_funds_and_positions();
        result
    }

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        let result = self.inner.open_short(symbol, quantity, leverage).await;
        self.invalidate_funds_and_positions();
        result
    }

    async fn open_long_limit(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderAck> {
        let result = self
            .inner
            .open_long_limit(symbol, quantity, leverage, price)
            .await;
        self.invalidate_funds_and_positions();
        result
    }

    async fn open_short_limit(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
        price: f64,
    ) -> Result<OrderAck> {
        let result = self
            .inner
            .open_short_limit(symbol, quantity, leverage, price)
            .await;
        self.invalidate_funds_and_positions();
        result
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        let result = self.inner.close_long(symbol, quantity).await;
        self.invalidate_funds_and_positions();
        result
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        let result = self.inner.close_short(symbol, quantity).await;
        self.invalidate_funds_and_positions();
        result
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let result = self.inner.set_leverage(symbol, leverage).await;
        self.invalidate_positions();
        result
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<()> {
        let result = self.inner.set_margin_mode(symbol, is_cross).await;
        self.invalidate_positions();
        result
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64> {
        self.inner.get_market_price(symbol).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck> {
        let result = self.inner.set_stop_loss(symbol, side, quantity, price).await;
        self.invalidate_positions();
        result
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck> {
        let result = self
            .inner
            .set_take_profit(symbol, side, quantity, price)
            .await;
        self.invalidate_positions();
        result
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<()> {
        let result = self.inner.cancel_stop_loss_orders(symbol).await;
        self.invalidate_positions();
        result
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<()> {
        let result = self.inner.cancel_take_profit_orders(symbol).await;
        self.invalidate_positions();
        result
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let result = self.inner.cancel_all_orders(symbol).await;
        self.invalidate_positions();
        result
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let result = self.inner.cancel_order(symbol, order_id).await;
        self.invalidate_positions();
        result
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus> {
        self.inner.get_order_status(symbol, order_id).await
    }

    fn format_quantity(&self, symbol: &str, quantity: f64) -> f64 {
        self.inner.format_quantity(symbol, quantity)
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        self.inner.get_open_orders(symbol).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Venue stub that counts how often each read reaches it.
    #[derive(Default)]
    struct CountingVenue {
        balance_calls: AtomicU32,
        position_calls: AtomicU32,
    }

    #[async_trait]
    impl Exchange for CountingVenue {
        async fn get_balance(&self) -> Result<BalanceMap> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            let mut map = BalanceMap::new();
            map.insert(super::super::KEY_TOTAL_WALLET_BALANCE.to_string(), 1000.0);
            map.insert(super::super::KEY_TOTAL_UNREALIZED_PROFIT.to_string(), 0.0);
            Ok(map)
        }

        async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
            self.position_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn open_long(&self, _s: &str, _q: f64, _l: u32) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "1".into(),
                avg_price: 0.0,
            })
        }

        async fn open_short(&self, _s: &str, _q: f64, _l: u32) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "2".into(),
                avg_price: 0.0,
            })
        }

        async fn open_long_limit(&self, _s: &str, _q: f64, _l: u32, _p: f64) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "3".into(),
                avg_price: 0.0,
            })
        }

        async fn open_short_limit(&self, _s: &str, _q: f64, _l: u32, _p: f64) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "4".into(),
                avg_price: 0.0,
            })
        }

        async fn close_long(&self, _s: &str, _q: f64) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "5".into(),
                avg_price: 0.0,
            })
        }

        async fn close_short(&self, _s: &str, _q: f64) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "6".into(),
                avg_price: 0.0,
            })
        }

        async fn set_leverage(&self, _s: &str, _l: u32) -> Result<()> {
            Ok(())
        }

        async fn set_margin_mode(&self, _s: &str, _c: bool) -> Result<()> {
            Ok(())
        }

        async fn get_market_price(&self, _s: &str) -> Result<f64> {
            Ok(100.0)
        }

        async fn set_stop_loss(
            &self,
            _s: &str,
            _side: PositionSide,
            _q: f64,
            _p: f64,
        ) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "7".into(),
                avg_price: 0.0,
            })
        }

        async fn set_take_profit(
            &self,
            _s: &str,
            _side: PositionSide,
            _q: f64,
            _p: f64,
        ) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "8".into(),
                avg_price: 0.0,
            })
        }

        async fn cancel_stop_loss_orders(&self, _s: &str) -> Result<()> {
            Ok(())
        }

        async fn cancel_take_profit_orders(&self, _s: &str) -> Result<()> {
            Ok(())
        }

        async fn cancel_all_orders(&self, _s: &str) -> Result<()> {
            Ok(())
        }

        async fn cancel_order(&self, _s: &str, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn get_order_status(&self, _s: &str, _id: &str) -> Result<OrderStatus> {
            Ok(OrderStatus::Filled)
        }

        fn format_quantity(&self, _s: &str, quantity: f64) -> f64 {
            quantity
        }

        async fn get_open_orders(&self, _s: &str) -> Result<Vec<OpenOrder>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn reads_within_ttl_hit_the_cache() {
        let venue = CachedExchange::new(CountingVenue::default());

        venue.get_balance().await.unwrap();
        venue.get_balance().await.unwrap();
        venue.get_positions().await.unwrap();
        venue.get_positions().await.unwrap();

        assert_eq!(venue.inner.balance_calls.load(Ordering::SeqCst), 1);
        assert_eq!(venue.inner.position_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn order_submission_invalidates_both_caches() {
        let venue = CachedExchange::new(CountingVenue::default());

        venue.get_balance().await.unwrap();
        venue.get_positions().await.unwrap();

        venue.open_long("BTCUSDT", 0.01, 10).await.unwrap();

        // Both reads must reach the venue again, irrespective of TTL.
        venue.get_balance().await.unwrap();
        venue.get_positions().await.unwrap();
        assert_eq!(venue.inner.balance_calls.load(Ordering::SeqCst), 2);
        assert_eq!(venue.inner.position_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_invalidates_both_caches() {
        let venue = CachedExchange::new(CountingVenue::default());

        venue.get_balance().await.unwrap();
        venue.get_positions().await.unwrap();
        venue.close_short("ETHUSDT", 0.0).await.unwrap();
        venue.get_balance().await.unwrap();
        venue.get_positions().await.unwrap();

        assert_eq!(venue.inner.balance_calls.load(Ordering::SeqCst), 2);
        assert_eq!(venue.inner.position_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn protective_orders_invalidate_positions_only() {
        let venue = CachedExchange::new(CountingVenue::default());

        venue.get_balance().await.unwrap();
        venue.get_positions().await.unwrap();

        venue
            .set_stop_loss("BTCUSDT", PositionSide::Long, 0.01, 49000.0)
            .await
            .unwrap();

        venue.get_balance().await.unwrap();
        venue.get_positions().await.unwrap();

        // Balance still served from cache; positions refetched.
        assert_eq!(venue.inner.balance_calls.load(Ordering::SeqCst), 1);
        assert_eq!(venue.inner.position_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_ttl_refetches() {
        let venue = CachedExchange::with_ttl(CountingVenue::default(), Duration::from_millis(0));

        venue.get_balance().await.unwrap();
        venue.get_balance().await.unwrap();
        assert_eq!(venue.inner.balance_calls.load(Ordering::SeqCst), 2);
    }
}
