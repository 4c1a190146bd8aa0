// =============================================================================
// Passive-Close Detection — infer why a position vanished between cycles
// =============================================================================
//
// Positions can disappear without the engine closing them: a stop-loss or
// take-profit fired, the venue liquidated, or someone closed manually. Each
// cycle compares the previous snapshot against exchange truth and, for every
// vanished position, infers the cause with a most-severe-first ladder:
//
//   1. liquidation  — last mark within 2% of the liquidation price
//   2. stop_loss    — last mark within 1% of the recorded SL, losing side
//   3. take_profit  — last mark within 1% of the recorded TP, winning side
//   4. unknown      — manual close or other cause; last mark is the estimate
// =============================================================================

use std::collections::HashSet;

use tracing::{info, warn};

use crate::record::{AutoCloseEvent, CycleRecord};
use crate::types::{CloseReason, PositionSide, PositionState, TradeKind};

use super::AutoTrader;

/// Proximity threshold for liquidation inference.
const LIQUIDATION_PROXIMITY: f64 = 0.02;
/// Proximity threshold for SL/TP inference.
const PROTECTIVE_PROXIMITY: f64 = 0.01;

/// Relative distance of `mark` from `target` within `pct`.
fn near(mark: f64, target: f64, pct: f64) -> bool {
    target > 0.0 && ((mark - target) / target).abs() <= pct
}

/// Infer the close reason and estimated close price for a vanished position.
pub fn infer_passive_close(snapshot: &PositionState) -> (CloseReason, f64) {
    let mark = snapshot.mark_price;

    // 1. Liquidation outranks everything when the mark sat near the
    //    liquidation price on the losing side.
    let liq = snapshot.liquidation_price;
    if near(mark, liq, LIQUIDATION_PROXIMITY) {
        let losing = match snapshot.side {
            PositionSide::Long => mark <= liq * (1.0 + LIQUIDATION_PROXIMITY),
            PositionSide::Short => mark >= liq * (1.0 - LIQUIDATION_PROXIMITY),
        };
        if losing {
            return (CloseReason::Liquidation, liq);
        }
    }

    // 2. Stop-loss: mark near the recorded SL in the losing direction.
    let sl = snapshot.stop_loss;
    if near(mark, sl, PROTECTIVE_PROXIMITY) {
        let losing = match snapshot.side {
            PositionSide::Long => mark <= sl * (1.0 + PROTECTIVE_PROXIMITY),
            PositionSide::Short => mark >= sl * (1.0 - PROTECTIVE_PROXIMITY),
        };
        if losing {
            return (CloseReason::StopLoss, sl);
        }
    }

    // 3. Take-profit: mark near the recorded TP in the winning direction.
    let tp = snapshot.take_profit;
    if near(mark, tp, PROTECTIVE_PROXIMITY) {
        let winning = match snapshot.side {
            PositionSide::Long => mark >= tp * (1.0 - PROTECTIVE_PROXIMITY),
            PositionSide::Short => mark <= tp * (1.0 + PROTECTIVE_PROXIMITY),
        };
        if winning {
            return (CloseReason::TakeProfit, tp);
        }
    }

    // 4. No protective order explains it.
    (CloseReason::Unknown, mark)
}

impl AutoTrader {
    /// Diff the previous snapshot against current exchange truth and emit an
    /// auto-close for every vanished position. Trade records are persisted
    /// immediately; events are appended to the cycle record.
    pub(crate) fn detect_passive_closes(
        &self,
        current_keys: &HashSet<String>,
        record: &mut CycleRecord,
    ) {
        let vanished: Vec<PositionState> = {
            let state = self.state.read();
            state
                .last_positions
                .values()
                .filter(|p| !current_keys.contains(&p.key()))
                .cloned()
                .collect()
        };

        for snapshot in vanished {
            let (reason, close_price) = infer_passive_close(&snapshot);
            let pnl =
                snapshot.side.sign() * (close_price - snapshot.entry_price) * snapshot.quantity;
            let pnl_pct = if snapshot.margin_used > 0.0 {
                pnl / snapshot.margin_used * 100.0
            } else {
                0.0
            };

            info!(
                symbol = %snapshot.symbol,
                side = %snapshot.side,
                reason = %reason,
                close_price,
                pnl,
                "position closed by the exchange since last cycle"
            );

            let trade = crate::persistence::TradeRecord::new(
                &self.config.id,
                &snapshot.symbol,
                snapshot.side,
                TradeKind::AutoClose,
                snapshot.quantity,
                close_price,
                reason.to_string(),
            )
            .with_pnl(pnl, pnl_pct);

            if let Err(e) = self.store.record_trade(&trade) {
                warn!(error = %e, "failed to persist auto-close trade");
            }

            record.auto_closes.push(AutoCloseEvent {
                symbol: snapshot.symbol.clone(),
                side: snapshot.side,
                quantity: snapshot.quantity,
                close_price,
                reason,
                pnl,
            });
        }
    }
}
