// =============================================================================
// Drawdown Monitor Loop — peak-relative giveback emergency close
// =============================================================================
//
// Runs as a second background task per trader, waking every 60 seconds to:
//   1. Read current positions through the same venue adapter as the main
//      loop (the shared caches admit both readers).
//   2. Track each position's peak raw P&L percent.
//   3. Force-close any position that was meaningfully in profit and has
//      given back too much of that peak.
//   4. Persist an EMERGENCY_CLOSE trade for every forced close.
//
// The raw P&L percent ignores fees: ((mark - entry) / entry) * leverage * 100
// for longs, mirrored for shorts.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::exchange::Exchange;
use crate::persistence::{Store, TradeRecord};
use crate::types::{position_key, PositionSide, TradeKind};

/// Interval at which the monitor evaluates open positions.
const MONITOR_INTERVAL_SECS: u64 = 60;

/// A position must be at least this far in profit before the giveback rule
/// applies.
const MIN_PROFIT_PCT: f64 = 5.0;

/// Fraction of the peak that may be given back before a forced close.
const MAX_GIVEBACK_PCT: f64 = 40.0;

/// Shared peak-P&L cache keyed by `<symbol>_<side>`.
pub type PeakPnlCache = Arc<RwLock<HashMap<String, f64>>>;

/// Whether a position at `current_pct` P&L, having peaked at `peak_pct`,
/// must be force-closed.
pub fn should_emergency_close(peak_pct: f64, current_pct: f64) -> bool {
    if current_pct <= MIN_PROFIT_PCT || peak_pct <= 0.0 {
        return false;
    }
    (peak_pct - current_pct) / peak_pct * 100.0 >= MAX_GIVEBACK_PCT
}

/// Run the drawdown monitor until the stop channel fires. Spawned by the
/// trader's `run()`; joined by `stop()`.
pub async fn run_drawdown_monitor(
    trader_id: String,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn Store>,
    peak_cache: PeakPnlCache,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(
        trader_id = %trader_id,
        interval_secs = MONITOR_INTERVAL_SECS,
        "drawdown monitor started"
    );

    let mut ticker = interval(Duration::from_secs(MONITOR_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                monitor_tick(&trader_id, exchange.as_ref(), store.as_ref(), &peak_cache).await;
            }
            _ = stop_rx.changed() => {
                info!(trader_id = %trader_id, "drawdown monitor stopping");
                break;
            }
        }
    }
}

/// One evaluation pass over all open positions.
pub(crate) async fn monitor_tick(
    trader_id: &str,
    exchange: &dyn Exchange,
    store: &dyn Store,
    peak_cache: &RwLock<HashMap<String, f64>>,
) {
    let positions = match exchange.get_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            warn!(error = %e, "drawdown monitor: failed to fetch positions");
            return;
        }
    };

    if positions.is_empty() {
        debug!("drawdown monitor: no open positions");
        return;
    }

    for position in positions.iter().filter(|p| p.quantity() > 0.0) {
        if position.entry_price <= 0.0 {
            continue;
        }

        let key = position_key(&position.symbol, position.side);
        let current_pct = position.side.sign()
            * ((position.mark_price - position.entry_price) / position.entry_price)
            * position.leverage.max(1) as f64
            * 100.0;

        let peak_pct = {
            let mut cache = peak_cache.write();
            let entry = cache.entry(key.clone()).or_insert(current_pct);
            if current_pct > *entry {
                *entry = current_pct;
            }
            *entry
        };

        debug!(
            symbol = %position.symbol,
            side = %position.side,
            current_pct = format!("{current_pct:.2}"),
            peak_pct = format!("{peak_pct:.2}"),
            "drawdown monitor: position evaluated"
        );

        if !should_emergency_close(peak_pct, current_pct) {
            continue;
        }

        let giveback = (peak_pct - current_pct) / peak_pct * 100.0;
        warn!(
            symbol = %position.symbol,
            side = %position.side,
            peak_pct = format!("{peak_pct:.2}"),
            current_pct = format!("{current_pct:.2}"),
            giveback_pct = format!("{giveback:.2}"),
            "PEAK GIVEBACK EXCEEDED — emergency close"
        );

        let close_result = match position.side {
            PositionSide::Long => exchange.close_long(&position.symbol, 0.0).await,
            PositionSide::Short => exchange.close_short(&position.symbol, 0.0).await,
        };

        match close_result {
            Ok(_) => {
                let quantity = position.quantity();
                let pnl = position.side.sign()
                    * (position.mark_price - position.entry_price)
                    * quantity;

                let trade = TradeRecord::new(
                    trader_id,
                    &position.symbol,
                    position.side,
                    TradeKind::EmergencyClose,
                    quantity,
                    position.mark_price,
                    format!(
                        "profit giveback {giveback:.1}% from peak {peak_pct:.1}%"
                    ),
                )
                .with_pnl(pnl, current_pct);

                if let Err(e) = store.record_trade(&trade) {
                    warn!(error = %e, "failed to persist emergency-close trade");
                }

                peak_cache.write().remove(&key);
            }
            Err(e) => {
                warn!(
                    symbol = %position.symbol,
                    error = %e,
                    "emergency close failed — will retry next tick"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::persistence::MemoryStore;

    #[test]
    fn giveback_rule_boundaries() {
        // +20 peak falling to +11: giveback 45% >= 40 — close.
        assert!(should_emergency_close(20.0, 11.0));
        // +20 peak falling to +13: giveback 35% — hold.
        assert!(!should_emergency_close(20.0, 13.0));
        // Still below the profit floor: never close.
        assert!(!should_emergency_close(20.0, 4.0));
        // No profit peak recorded.
        assert!(!should_emergency_close(0.0, 10.0));
    }

    #[tokio::test]
    async fn tick_tracks_peak_and_closes_on_giveback() {
        let venue = PaperExchange::with_prices(10000.0, &[("ETHUSDT", 3000.0)]);
        let store = MemoryStore::new();
        let cache: RwLock<HashMap<String, f64>> = RwLock::new(HashMap::new());

        venue.open_long("ETHUSDT", 1.0, 10).await.unwrap();

        // +2% price * 10x leverage = +20% raw P&L. Peak established.
        venue.set_mark_price("ETHUSDT", 3060.0);
        monitor_tick("t1", &venue, &store, &cache).await;
        assert_eq!(cache.read()["ETHUSDT_long"], 20.0);
        assert_eq!(venue.get_positions().await.unwrap().len(), 1);

        // Fade to +1.1% price = +11% raw: giveback 45% — forced close.
        venue.set_mark_price("ETHUSDT", 3033.0);
        monitor_tick("t1", &venue, &store, &cache).await;

        assert!(venue.get_positions().await.unwrap().is_empty());
        assert!(cache.read().is_empty());

        let trades = store.trades("t1");
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].kind, TradeKind::EmergencyClose);
        assert!((trades[0].pnl - 33.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn tick_holds_within_giveback_budget() {
        let venue = PaperExchange::with_prices(10000.0, &[("ETHUSDT", 3000.0)]);
        let store = MemoryStore::new();
        let cache: RwLock<HashMap<String, f64>> = RwLock::new(HashMap::new());

        venue.open_long("ETHUSDT", 1.0, 10).await.unwrap();

        venue.set_mark_price("ETHUSDT", 3060.0); // +20%
        monitor_tick("t1", &venue, &store, &cache).await;

        venue.set_mark_price("ETHUSDT", 3039.0); // +13%: giveback 35%
        monitor_tick("t1", &venue, &store, &cache).await;

        assert_eq!(venue.get_positions().await.unwrap().len(), 1);
        assert!(store.trades("t1").is_empty());
    }

    #[tokio::test]
    async fn short_positions_use_mirrored_pnl() {
        let venue = PaperExchange::with_prices(10000.0, &[("SOLUSDT", 100.0)]);
        let store = MemoryStore::new();
        let cache: RwLock<HashMap<String, f64>> = RwLock::new(HashMap::new());

        venue.open_short("SOLUSDT", 10.0, 10).await.unwrap();

        // Price down 2% → short is +20%.
        venue.set_mark_price("SOLUSDT", 98.0);
        monitor_tick("t1", &venue, &store, &cache).await;
        assert!((cache.read()["SOLUSDT_short"] - 20.0).abs() < 1e-9);

        // Price back up to -1.1% from entry → +11%: giveback 45%.
        venue.set_mark_price("SOLUSDT", 98.9);
        monitor_tick("t1", &venue, &store, &cache).await;
        assert!(venue.get_positions().await.unwrap().is_empty());
    }
}
