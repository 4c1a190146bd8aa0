// =============================================================================
// Risk Supervisor — daily P&L baseline, peak-equity drawdown, trading pause
// =============================================================================
//
// Evaluated once per cycle after the P&L update. Two limits:
//
//   1. Daily Loss    — trips when the day's P&L falls below a percentage of
//                      the daily baseline equity.
//   2. Max Drawdown  — trips when equity gives back a percentage of the
//                      all-time peak.
//
// Tripping either limit pauses trading until `now + pause`; paused cycles
// short-circuit before any venue or model call. Daily statistics reset
// automatically when the local calendar date rolls over; the baseline then
// re-syncs to the next observed equity.
// =============================================================================

use chrono::{DateTime, Duration, Local, TimeZone};
use parking_lot::RwLock;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    daily_pnl_base: f64,
    daily_pnl: f64,
    /// Set on construction and at every date rollover; the next observed
    /// equity becomes the new baseline.
    baseline_needs_sync: bool,
    last_reset: DateTime<Local>,
    peak_equity: f64,
    stop_until: Option<DateTime<Local>>,
}

// ---------------------------------------------------------------------------
// RiskSupervisor
// ---------------------------------------------------------------------------

/// Per-trader account-level risk supervisor.
pub struct RiskSupervisor {
    /// Daily loss limit as a percent of the daily baseline. 0 disables.
    max_daily_loss_pct: f64,
    /// Peak-equity drawdown limit in percent. 0 disables.
    max_drawdown_pct: f64,
    /// How long trading pauses after a trip.
    pause: Duration,
    state: RwLock<Inner>,
}

impl RiskSupervisor {
    pub fn new(max_daily_loss_pct: f64, max_drawdown_pct: f64, pause_minutes: i64) -> Self {
        Self {
            max_daily_loss_pct,
            max_drawdown_pct,
            pause: Duration::minutes(pause_minutes.max(1)),
            state: RwLock::new(Inner {
                daily_pnl_base: 0.0,
                daily_pnl: 0.0,
                baseline_needs_sync: true,
                last_reset: Local::now(),
                peak_equity: 0.0,
                stop_until: None,
            }),
        }
    }

    /// Rehydrate restorable counters from the store.
    pub fn restore(&self, peak_equity: f64, last_reset_ms: i64) {
        let mut s = self.state.write();
        s.peak_equity = peak_equity;
        if let Some(at) = Local.timestamp_millis_opt(last_reset_ms).single() {
            s.last_reset = at;
        }
    }

    // -------------------------------------------------------------------------
    // Pause gate
    // -------------------------------------------------------------------------

    /// The pause deadline, when trading is currently paused.
    pub fn paused_until(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let s = self.state.read();
        s.stop_until.filter(|until| now < *until)
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    /// Reset daily statistics when the calendar date has rolled over since
    /// the last reset. Returns true when a reset happened.
    pub fn maybe_reset_daily(&self, now: DateTime<Local>) -> bool {
        {
            let s = self.state.read();
            if s.last_reset.date_naive() == now.date_naive() {
                return false;
            }
        }
        // Date has changed — acquire write lock and double-check.
        let mut s = self.state.write();
        if s.last_reset.date_naive() == now.date_naive() {
            return false;
        }
        info!(
            old_date = %s.last_reset.date_naive(),
            new_date = %now.date_naive(),
            "date rolled — resetting daily P&L"
        );
        s.daily_pnl = 0.0;
        s.baseline_needs_sync = true;
        s.last_reset = now;
        true
    }

    // -------------------------------------------------------------------------
    // P&L update
    // -------------------------------------------------------------------------

    /// Fold this cycle's equity into the daily P&L and the peak. Returns the
    /// updated daily P&L.
    pub fn update_pnl(&self, equity: f64) -> f64 {
        let mut s = self.state.write();

        if s.baseline_needs_sync {
            s.daily_pnl_base = equity;
            s.daily_pnl = 0.0;
            s.baseline_needs_sync = false;
            info!(baseline = equity, "daily P&L baseline synced");
        } else {
            s.daily_pnl = equity - s.daily_pnl_base;
        }

        if equity > s.peak_equity {
            s.peak_equity = equity;
        }

        s.daily_pnl
    }

    // -------------------------------------------------------------------------
    // Limit enforcement
    // -------------------------------------------------------------------------

    /// Check both limits against the current equity. On a trip, sets the
    /// pause deadline and returns the reason.
    pub fn enforce(&self, equity: f64, now: DateTime<Local>) -> Option<String> {
        let mut s = self.state.write();

        if self.max_daily_loss_pct > 0.0 {
            let allowed_loss = s.daily_pnl_base * self.max_daily_loss_pct / 100.0;
            if s.daily_pnl <= -allowed_loss && allowed_loss > 0.0 {
                let until = now + self.pause;
                s.stop_until = Some(until);
                let msg = format!(
                    "daily loss limit tripped: {:.2} <= -{:.2} ({}% of baseline {:.2}); paused until {}",
                    s.daily_pnl, allowed_loss, self.max_daily_loss_pct, s.daily_pnl_base, until
                );
                warn!("{}", msg);
                return Some(msg);
            }
        }

        if self.max_drawdown_pct > 0.0 && s.peak_equity > 0.0 {
            let drawdown_pct = (s.peak_equity - equity) / s.peak_equity * 100.0;
            if drawdown_pct >= self.max_drawdown_pct {
                let until = now + self.pause;
                s.stop_until = Some(until);
                let msg = format!(
                    "drawdown limit tripped: {:.2}% from peak {:.2} (limit {}%); paused until {}",
                    drawdown_pct, s.peak_equity, self.max_drawdown_pct, until
                );
                warn!("{}", msg);
                return Some(msg);
            }
        }

        None
    }

    // -------------------------------------------------------------------------
    // Accessors for persistence and context
    // -------------------------------------------------------------------------

    pub fn peak_equity(&self) -> f64 {
        self.state.read().peak_equity
    }

    pub fn daily_pnl(&self) -> f64 {
        self.state.read().daily_pnl
    }

    pub fn last_reset_ms(&self) -> i64 {
        self.state.read().last_reset.timestamp_millis()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn first_update_syncs_baseline() {
        let risk = RiskSupervisor::new(5.0, 0.0, 60);
        let pnl = risk.update_pnl(1000.0);
        assert_eq!(pnl, 0.0);
        assert_eq!(risk.peak_equity(), 1000.0);

        let pnl = risk.update_pnl(960.0);
        assert_eq!(pnl, -40.0);
    }

    #[test]
    fn daily_loss_trips_and_pauses() {
        // Scenario: baseline 1000, limit 5%, pause 30 minutes.
        let risk = RiskSupervisor::new(5.0, 0.0, 30);
        let now = at(2026, 3, 2, 12);

        risk.update_pnl(1000.0);
        assert!(risk.enforce(1000.0, now).is_none());

        // Equity drops to 940: daily P&L -60 <= -50.
        risk.update_pnl(940.0);
        let trip = risk.enforce(940.0, now);
        assert!(trip.is_some());
        assert!(trip.unwrap().contains("daily loss"));

        // Paused for the next 30 minutes, free afterwards.
        assert!(risk.paused_until(now + Duration::minutes(29)).is_some());
        assert!(risk.paused_until(now + Duration::minutes(31)).is_none());
    }

    #[test]
    fn loss_within_limit_does_not_trip() {
        let risk = RiskSupervisor::new(5.0, 0.0, 30);
        let now = at(2026, 3, 2, 12);
        risk.update_pnl(1000.0);
        risk.update_pnl(960.0); // -40 > -50
        assert!(risk.enforce(960.0, now).is_none());
    }

    #[test]
    fn drawdown_trips_from_peak() {
        let risk = RiskSupervisor::new(0.0, 10.0, 60);
        let now = at(2026, 3, 2, 12);

        risk.update_pnl(1000.0);
        risk.update_pnl(1200.0); // peak 1200
        assert!(risk.enforce(1200.0, now).is_none());

        risk.update_pnl(1080.0); // exactly 10% off the peak
        let trip = risk.enforce(1080.0, now);
        assert!(trip.is_some());
        assert!(trip.unwrap().contains("drawdown"));
    }

    #[test]
    fn disabled_limits_never_trip() {
        let risk = RiskSupervisor::new(0.0, 0.0, 60);
        let now = at(2026, 3, 2, 12);
        risk.update_pnl(1000.0);
        risk.update_pnl(1.0);
        assert!(risk.enforce(1.0, now).is_none());
    }

    #[test]
    fn date_rollover_resets_and_rebases() {
        let risk = RiskSupervisor::new(5.0, 0.0, 60);
        // Pin the reset date so the rollover comparison is deterministic.
        risk.restore(0.0, at(2026, 3, 2, 10).timestamp_millis());

        risk.update_pnl(1000.0);
        risk.update_pnl(950.0);
        assert_eq!(risk.daily_pnl(), -50.0);

        // Same local date: no reset.
        assert!(!risk.maybe_reset_daily(at(2026, 3, 2, 23)));
        assert_eq!(risk.daily_pnl(), -50.0);

        // Crossing local midnight: daily P&L zeroes, next equity rebases.
        assert!(risk.maybe_reset_daily(at(2026, 3, 3, 0)));
        assert_eq!(risk.daily_pnl(), 0.0);

        let pnl = risk.update_pnl(950.0);
        assert_eq!(pnl, 0.0); // rebased to 950
        assert_eq!(risk.update_pnl(900.0), -50.0);
    }

    #[test]
    fn restore_rehydrates_peak() {
        let risk = RiskSupervisor::new(0.0, 20.0, 60);
        risk.restore(2000.0, 1_700_000_000_000);
        assert_eq!(risk.peak_equity(), 2000.0);

        // 25% below the restored peak trips immediately.
        risk.update_pnl(1500.0);
        assert!(risk.enforce(1500.0, at(2026, 3, 2, 12)).is_some());
    }
}
