// =============================================================================
// AutoTrader — one model-driven trading loop per configured trader
// =============================================================================
//
// Each trader owns two long-lived activities:
//
//   - the main loop: every ScanInterval it assembles context, asks the model
//     for decisions, executes them in priority order, refreshes the position
//     snapshot, and persists a cycle record;
//   - the drawdown monitor: an independent 60-second loop that force-closes
//     positions giving back too much of their peak profit.
//
// A cycle never propagates an error upward: every failure is recorded into
// the cycle's record and the loop keeps ticking. `stop()` signals the shared
// stop channel and joins the monitor before returning.
// =============================================================================

pub mod context;
pub mod execute;
pub mod monitor;
pub mod passive;
pub mod risk;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::coins::CandidateProvider;
use crate::config::TraderConfig;
use crate::exchange::Exchange;
use crate::llm::DecisionClient;
use crate::market::MarketData;
use crate::persistence::{Store, TradeRecord, TraderStateSnapshot};
use crate::record::{AutoCloseEvent, CycleOutcome, CycleRecord};
use crate::types::{
    parse_position_key, position_key, sort_decisions, CloseReason, DecisionAction, PositionState,
    TradeKind,
};

use self::monitor::PeakPnlCache;
use self::risk::RiskSupervisor;

/// Pause between successful actions so venue state propagates before the
/// next order.
const ACTION_YIELD: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Mutable per-trader state
// ---------------------------------------------------------------------------

/// Everything a trader mutates between cycles, behind one lock.
#[derive(Default)]
pub(crate) struct TraderState {
    pub call_count: u64,
    /// Snapshot of positions as of the end of the previous cycle.
    pub last_positions: HashMap<String, PositionState>,
    /// First-sighting timestamps (ms) keyed by `<symbol>_<side>`.
    pub first_seen: HashMap<String, i64>,
    /// Stop-loss prices the engine has placed, keyed like `first_seen`.
    pub stop_loss: HashMap<String, f64>,
    /// Take-profit prices the engine has placed.
    pub take_profit: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// AutoTrader
// ---------------------------------------------------------------------------

pub struct AutoTrader {
    pub(crate) config: TraderConfig,
    pub(crate) exchange: Arc<dyn Exchange>,
    pub(crate) model: Arc<dyn DecisionClient>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) market: Option<Arc<dyn MarketData>>,
    pub(crate) candidates: Arc<dyn CandidateProvider>,
    pub(crate) risk: RiskSupervisor,
    pub(crate) state: RwLock<TraderState>,
    /// Peak raw P&L percent per position, shared with the drawdown monitor.
    pub(crate) peak_pnl: PeakPnlCache,

    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    monitor_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl AutoTrader {
    /// Build a trader and rehydrate its restorable state from the store.
    pub fn new(
        config: TraderConfig,
        exchange: Arc<dyn Exchange>,
        model: Arc<dyn DecisionClient>,
        store: Arc<dyn Store>,
        market: Option<Arc<dyn MarketData>>,
        candidates: Arc<dyn CandidateProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let risk = RiskSupervisor::new(
            config.max_daily_loss_pct,
            config.max_drawdown_pct,
            config.stop_trading_minutes,
        );

        let mut state = TraderState::default();

        match store.load_trader_state(&config.id) {
            Ok(Some(snapshot)) => {
                state.call_count = snapshot.call_count;
                risk.restore(snapshot.peak_equity, snapshot.last_reset_ms);
                info!(
                    trader_id = %config.id,
                    call_count = snapshot.call_count,
                    peak_equity = snapshot.peak_equity,
                    "trader state restored"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(trader_id = %config.id, error = %e, "failed to load trader state"),
        }

        match store.open_positions_from_history(&config.id) {
            Ok(open) => {
                for (key, record) in open {
                    state.first_seen.insert(key.clone(), record.first_seen_ms);
                    if record.stop_loss > 0.0 {
                        state.stop_loss.insert(key.clone(), record.stop_loss);
                    }
                    if record.take_profit > 0.0 {
                        state.take_profit.insert(key, record.take_profit);
                    }
                }
            }
            Err(e) => warn!(trader_id = %config.id, error = %e, "failed to load open positions"),
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            config,
            exchange,
            model,
            store,
            market,
            candidates,
            risk,
            state: RwLock::new(state),
            peak_pnl: Arc::new(RwLock::new(HashMap::new())),
            stop_tx,
            stop_rx,
            monitor_handle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Run the main loop until `stop()` fires. Spawns the drawdown monitor
    /// as a child task whose lifetime is bounded by this call.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(trader_id = %self.config.id, "trader is already running");
            return;
        }

        info!(
            trader_id = %self.config.id,
            scan_interval_secs = self.config.scan_interval_secs,
            venue = %self.config.venue,
            model = %self.config.model_name,
            "trader loop starting"
        );

        let monitor = tokio::spawn(monitor::run_drawdown_monitor(
            self.config.id.clone(),
            self.exchange.clone(),
            self.store.clone(),
            self.peak_pnl.clone(),
            self.stop_rx.clone(),
        ));
        *self.monitor_handle.lock().await = Some(monitor);

        let mut ticker = interval(Duration::from_secs(self.config.scan_interval_secs));
        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = stop_rx.changed() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(trader_id = %self.config.id, "trader loop stopped");
    }

    /// Stop the trader. Idempotent: signals the stop channel and waits for
    /// the drawdown monitor to exit. In-flight venue calls are not cancelled;
    /// the next start's reconciliation converges any partial cycle.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);

        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(trader_id = %self.config.id, error = %e, "drawdown monitor join failed");
            }
        }

        info!(trader_id = %self.config.id, "trader stopped");
    }

    // -------------------------------------------------------------------------
    // The cycle
    // -------------------------------------------------------------------------

    /// One complete trading cycle. Never returns an error: every failure is
    /// recorded and persisted, and the loop carries on.
    pub async fn run_cycle(&self) {
        let cycle_number = {
            let mut state = self.state.write();
            state.call_count += 1;
            state.call_count
        };
        let mut record = CycleRecord::begin(&self.config.id, cycle_number);
        let now = Local::now();

        // ── Pause gate ──────────────────────────────────────────────────
        if let Some(until) = self.risk.paused_until(now) {
            info!(trader_id = %self.config.id, until = %until, "cycle skipped: trading paused");
            record.outcome = CycleOutcome::Paused;
            record.error = Some(format!("trading paused until {until}"));
            self.persist_cycle(&record);
            return;
        }

        // ── Daily rollover ──────────────────────────────────────────────
        self.risk.maybe_reset_daily(now);

        // ── Reconcile the store's view against exchange truth ───────────
        self.reconcile_history(&mut record).await;

        // ── Context ─────────────────────────────────────────────────────
        let context = match self.build_context().await {
            Ok(context) => context,
            Err(e) => {
                warn!(trader_id = %self.config.id, error = %format!("{e:#}"), "context assembly failed");
                record.outcome = CycleOutcome::Failed;
                record.error = Some(format!("context assembly failed: {e:#}"));
                self.persist_cycle(&record);
                return;
            }
        };
        record.equity = context.account.total_equity;

        // ── P&L update + risk limits ────────────────────────────────────
        record.daily_pnl = self.risk.update_pnl(context.account.total_equity);

        if let Some(trip) = self.risk.enforce(context.account.total_equity, now) {
            record.outcome = CycleOutcome::RiskTripped;
            record.error = Some(trip);
            self.persist_cycle(&record);
            return;
        }

        // ── Passive closes since the previous cycle ─────────────────────
        let current_keys: HashSet<String> = context.positions.iter().map(|p| p.key()).collect();
        self.detect_passive_closes(&current_keys, &mut record);

        // ── Ask the model ───────────────────────────────────────────────
        let response = match self
            .model
            .decide(&context, &self.config.system_prompt_template, None, false)
            .await
        {
            Ok(response) => {
                record.system_prompt = Some(response.system_prompt.clone());
                record.user_prompt = Some(response.user_prompt.clone());
                if !response.thinking.is_empty() {
                    record.thinking = Some(response.thinking.clone());
                }
                record.model_elapsed_ms = response.elapsed_ms;
                response
            }
            Err(e) => {
                warn!(trader_id = %self.config.id, error = %format!("{e:#}"), "model call failed");
                record.outcome = CycleOutcome::Failed;
                record.error = Some(format!("model call failed: {e:#}"));
                self.persist_cycle(&record);
                return;
            }
        };

        // ── Execute in priority order ───────────────────────────────────
        let mut decisions = response.decisions;
        sort_decisions(&mut decisions);
        record.decisions = decisions.clone();

        for decision in &decisions {
            let result = self.execute_decision(decision).await;
            let yield_needed = result.success
                && !matches!(decision.action, DecisionAction::Hold | DecisionAction::Wait);
            record.action_results.push(result);

            if yield_needed {
                tokio::time::sleep(ACTION_YIELD).await;
            }
        }

        // ── Snapshot, then persist ──────────────────────────────────────
        self.refresh_snapshot().await;
        self.persist_cycle(&record);
    }

    // -------------------------------------------------------------------------
    // History reconciliation
    // -------------------------------------------------------------------------

    /// Positions the store believes are open but the exchange no longer
    /// shows get an AUTO_CLOSE trade at the current market price. Keys still
    /// present in the in-memory snapshot are left to the snapshot-based
    /// detector, which infers a richer close reason.
    async fn reconcile_history(&self, record: &mut CycleRecord) {
        let keys = match self.store.open_position_keys(&self.config.id) {
            Ok(keys) if !keys.is_empty() => keys,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "failed to read open positions from history");
                return;
            }
        };

        let positions = match self.exchange.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "reconcile: failed to fetch positions");
                return;
            }
        };

        let live: HashSet<String> = positions
            .iter()
            .filter(|p| p.quantity() > 0.0)
            .map(|p| position_key(&p.symbol, p.side))
            .collect();
        let snapshot_keys: HashSet<String> =
            self.state.read().last_positions.keys().cloned().collect();

        for key in keys {
            if live.contains(&key) || snapshot_keys.contains(&key) {
                continue;
            }
            let Some((symbol, side)) = parse_position_key(&key) else {
                warn!(key = %key, "unparseable position key in history");
                continue;
            };

            let close_price = match self.exchange.get_market_price(&symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "reconcile: no market price");
                    continue;
                }
            };

            let (entry_price, quantity) = self
                .store
                .last_open_trade(&self.config.id, &symbol, side)
                .unwrap_or(None)
                .unwrap_or((0.0, 0.0));
            let pnl = if entry_price > 0.0 && quantity > 0.0 {
                side.sign() * (close_price - entry_price) * quantity
            } else {
                0.0
            };

            info!(
                symbol = %symbol,
                side = %side,
                close_price,
                pnl,
                "history shows an open position the exchange no longer has"
            );

            let trade = TradeRecord::new(
                &self.config.id,
                &symbol,
                side,
                TradeKind::AutoClose,
                quantity,
                close_price,
                "exchange auto-close",
            )
            .with_pnl(pnl, 0.0);
            if let Err(e) = self.store.record_trade(&trade) {
                warn!(error = %e, "failed to persist reconcile auto-close");
            }

            record.auto_closes.push(AutoCloseEvent {
                symbol,
                side,
                quantity,
                close_price,
                reason: CloseReason::Unknown,
                pnl,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot refresh
    // -------------------------------------------------------------------------

    /// Overwrite `last_positions` with current exchange truth, enriched from
    /// the bookkeeping maps. Runs strictly after all actions.
    async fn refresh_snapshot(&self) {
        let positions = match self.exchange.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "failed to refresh position snapshot");
                return;
            }
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut state = self.state.write();
        let peak_cache = self.peak_pnl.read();
        let mut snapshot = HashMap::new();

        for vp in positions.iter().filter(|p| p.quantity() != 0.0) {
            let quantity = vp.quantity();
            let key = position_key(&vp.symbol, vp.side);
            let margin = quantity * vp.entry_price / vp.leverage.max(1) as f64;
            let first_seen = *state.first_seen.entry(key.clone()).or_insert(now_ms);

            snapshot.insert(
                key.clone(),
                PositionState {
                    symbol: vp.symbol.clone(),
                    side: vp.side,
                    quantity,
                    entry_price: vp.entry_price,
                    mark_price: vp.mark_price,
                    leverage: vp.leverage,
                    unrealized_pnl: vp.unrealized_profit,
                    unrealized_pnl_pct: if margin > 0.0 {
                        vp.unrealized_profit / margin * 100.0
                    } else {
                        0.0
                    },
                    peak_pnl_pct: peak_cache.get(&key).copied().unwrap_or(0.0),
                    liquidation_price: vp.liquidation_price,
                    margin_used: margin,
                    first_seen_ms: first_seen,
                    stop_loss: state.stop_loss.get(&key).copied().unwrap_or(0.0),
                    take_profit: state.take_profit.get(&key).copied().unwrap_or(0.0),
                },
            );
        }

        state.last_positions = snapshot;
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Persist the cycle record and the trader-state snapshot. Persistence
    /// failures are logged, never surfaced.
    fn persist_cycle(&self, record: &CycleRecord) {
        if let Err(e) = self.store.log_decision(record) {
            warn!(trader_id = %self.config.id, error = %e, "failed to persist cycle record");
        }

        let snapshot = TraderStateSnapshot {
            user_id: String::new(),
            call_count: self.state.read().call_count,
            peak_equity: self.risk.peak_equity(),
            last_reset_ms: self.risk.last_reset_ms(),
            state_blob: serde_json::Value::Null,
        };
        if let Err(e) = self.store.save_trader_state(&self.config.id, &snapshot) {
            warn!(trader_id = %self.config.id, error = %e, "failed to persist trader state");
        }
    }
}


// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::Exchange;
    use crate::types::{Decision, PositionSide};

    fn paper_venue(balance: f64, prices: &[(&str, f64)]) -> Arc<PaperExchange> {
        Arc::new(PaperExchange::with_prices(balance, prices))
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_executes_decisions_in_priority_order() {
        let venue = paper_venue(1000.0, &[("BTCUSDT", 50000.0), ("ETHUSDT", 3000.0)]);
        let mut open = Decision::new(DecisionAction::OpenLong, "BTCUSDT");
        open.position_size_usd = 500.0;
        open.leverage = 10;
        open.stop_loss = 49000.0;
        open.take_profit = 52000.0;

        let scripts = vec![vec![
            open,
            Decision::new(DecisionAction::Hold, "ETHUSDT"),
            Decision::new(DecisionAction::CloseLong, "ETHUSDT"),
        ]];
        let (trader, store, _model) =
            make_trader_scripted(TraderConfig::paper("t1", 1000.0), venue.clone(), scripts);

        trader.run_cycle().await;

        let cycles = store.cycles("t1");
        assert_eq!(cycles.len(), 1);
        let record = &cycles[0];
        assert_eq!(record.outcome, CycleOutcome::Completed);

        // close first, then the open, then hold.
        let order: Vec<DecisionAction> = record.decisions.iter().map(|d| d.action).collect();
        assert_eq!(
            order,
            vec![
                DecisionAction::CloseLong,
                DecisionAction::OpenLong,
                DecisionAction::Hold
            ]
        );
        assert_eq!(record.action_results.len(), 3);

        // The close had no position behind it and failed; the open succeeded.
        assert!(!record.action_results[0].success);
        assert!(record.action_results[1].success);
        assert!(record.action_results[2].success);

        // Snapshot updated after the actions.
        assert!(trader.state.read().last_positions.contains_key("BTCUSDT_long"));
    }

    #[tokio::test(start_paused = true)]
    async fn risk_trip_pauses_subsequent_cycles() {
        // Daily loss limit 5% of a 1000 baseline, 30-minute pause.
        let venue = paper_venue(1000.0, &[("ETHUSDT", 3000.0)]);
        let mut config = TraderConfig::paper("t1", 1000.0);
        config.max_daily_loss_pct = 5.0;
        config.stop_trading_minutes = 30;

        let (trader, store, model) =
            make_trader_scripted(config, venue.clone(), vec![vec![], vec![], vec![]]);

        // Cycle 1: equity 1000, baseline syncs, model consulted.
        trader.run_cycle().await;
        assert_eq!(model.call_count(), 1);

        // The account bleeds: a long position goes 60 under water.
        venue.open_long("ETHUSDT", 1.0, 10).await.unwrap();
        venue.set_mark_price("ETHUSDT", 2940.0);

        // Cycle 2: daily P&L -60 <= -50 trips the limit before any model call.
        trader.run_cycle().await;
        assert_eq!(model.call_count(), 1);

        // Cycle 3: still inside the pause window; nothing reaches the model.
        trader.run_cycle().await;
        assert_eq!(model.call_count(), 1);

        let outcomes: Vec<CycleOutcome> =
            store.cycles("t1").iter().map(|c| c.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                CycleOutcome::Completed,
                CycleOutcome::RiskTripped,
                CycleOutcome::Paused
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn passive_stop_loss_close_detected() {
        let venue = paper_venue(1000.0, &[("BTCUSDT", 49100.0)]);
        let (trader, store, _model) = make_trader_scripted(
            TraderConfig::paper("t1", 1000.0),
            venue,
            vec![vec![]],
        );

        // Previous cycle held a long with a 49000 stop; last mark 49100.
        trader.state.write().last_positions.insert(
            "BTCUSDT_long".to_string(),
            PositionState {
                symbol: "BTCUSDT".into(),
                side: PositionSide::Long,
                quantity: 0.01,
                entry_price: 50000.0,
                mark_price: 49100.0,
                leverage: 10,
                unrealized_pnl: -9.0,
                unrealized_pnl_pct: -18.0,
                peak_pnl_pct: 0.0,
                liquidation_price: 45000.0,
                margin_used: 50.0,
                first_seen_ms: 1,
                stop_loss: 49000.0,
                take_profit: 52000.0,
            },
        );

        trader.run_cycle().await;

        let cycles = store.cycles("t1");
        let record = &cycles[0];
        assert_eq!(record.auto_closes.len(), 1);
        assert_eq!(record.auto_closes[0].reason, CloseReason::StopLoss);
        assert_eq!(record.auto_closes[0].close_price, 49000.0);

        let trades = store.trades("t1");
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].kind, TradeKind::AutoClose);
        assert_eq!(trades[0].price, 49000.0);
        assert_eq!(trades[0].reason, "stop_loss");

        // The snapshot no longer holds the vanished position.
        assert!(trader.state.read().last_positions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn model_failure_recorded_without_actions() {
        let venue = paper_venue(1000.0, &[("BTCUSDT", 50000.0)]);
        let (trader, store, model) = make_trader_scripted(
            TraderConfig::paper("t1", 1000.0),
            venue.clone(),
            vec![],
        );
        model.fail.store(true, Ordering::SeqCst);

        trader.run_cycle().await;

        let cycles = store.cycles("t1");
        assert_eq!(cycles[0].outcome, CycleOutcome::Failed);
        assert!(cycles[0].error.as_deref().unwrap().contains("model call failed"));
        assert!(cycles[0].action_results.is_empty());
        assert!(venue.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restored_trader_continues_counters_and_bookkeeping() {
        let venue = paper_venue(1000.0, &[("ETHUSDT", 3000.0)]);
        let store = Arc::new(crate::persistence::MemoryStore::new());

        // A previous life: 5 cycles, one still-open position.
        store
            .save_trader_state(
                "t1",
                &TraderStateSnapshot {
                    user_id: String::new(),
                    call_count: 5,
                    peak_equity: 1200.0,
                    last_reset_ms: chrono::Utc::now().timestamp_millis(),
                    state_blob: serde_json::Value::Null,
                },
            )
            .unwrap();
        store
            .record_trade(
                &TradeRecord::new(
                    "t1",
                    "ETHUSDT",
                    PositionSide::Long,
                    TradeKind::Open,
                    1.0,
                    3000.0,
                    "entry",
                )
                .with_protection(2900.0, 3300.0),
            )
            .unwrap();

        // The venue still holds the position.
        venue.open_long("ETHUSDT", 1.0, 10).await.unwrap();

        let trader = Arc::new(
            AutoTrader::new(
                TraderConfig::paper("t1", 1000.0),
                venue.clone(),
                Arc::new(ScriptedModel::default()),
                store.clone(),
                None,
                Arc::new(NoopProvider),
            )
            .unwrap(),
        );

        {
            let state = trader.state.read();
            assert_eq!(state.call_count, 5);
            assert!(state.first_seen.contains_key("ETHUSDT_long"));
            assert_eq!(state.stop_loss["ETHUSDT_long"], 2900.0);
        }
        assert_eq!(trader.risk.peak_equity(), 1200.0);

        trader.run_cycle().await;
        assert_eq!(store.cycles("t1").last().unwrap().cycle_number, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_emits_auto_close_for_stale_history() {
        let venue = paper_venue(1000.0, &[("ETHUSDT", 3100.0)]);
        let store = Arc::new(crate::persistence::MemoryStore::new());

        // History says the long is open; the exchange shows nothing.
        store
            .record_trade(&TradeRecord::new(
                "t1",
                "ETHUSDT",
                PositionSide::Long,
                TradeKind::Open,
                1.0,
                3000.0,
                "entry",
            ))
            .unwrap();

        let trader = Arc::new(
            AutoTrader::new(
                TraderConfig::paper("t1", 1000.0),
                venue,
                Arc::new(ScriptedModel::with_scripts(vec![vec![]])),
                store.clone(),
                None,
                Arc::new(NoopProvider),
            )
            .unwrap(),
        );

        trader.run_cycle().await;

        let trades = store.trades("t1");
        let auto = trades.iter().find(|t| t.kind == TradeKind::AutoClose).unwrap();
        assert_eq!(auto.reason, "exchange auto-close");
        // Closed at the current market price with computed P&L.
        assert_eq!(auto.price, 3100.0);
        assert!((auto.pnl - 100.0).abs() < 1e-9);

        // The next cycle no longer reconciles it (history now closed).
        trader.run_cycle().await;
        let trades = store.trades("t1");
        assert_eq!(
            trades.iter().filter(|t| t.kind == TradeKind::AutoClose).count(),
            1
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_joins_monitor() {
        let venue = paper_venue(1000.0, &[("BTCUSDT", 50000.0)]);
        let mut config = TraderConfig::paper("t1", 1000.0);
        config.scan_interval_secs = 3600;
        let (trader, _store) = make_trader_with_config(config, venue);

        let runner = tokio::spawn(trader.clone().run());

        // Give the loop a moment to start its first tick.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(trader.is_running());

        trader.stop().await;
        trader.stop().await; // second stop is a no-op

        runner.await.unwrap();
        assert!(!trader.is_running());
    }
}
