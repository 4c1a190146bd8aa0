// =============================================================================
// Persistence — trader state, trade records, and the decision log
// =============================================================================
//
// Layout on disk (FileStore), one directory per trader:
//
//   <data_dir>/<trader_id>/state.json      latest trader-state snapshot
//   <data_dir>/<trader_id>/trades.jsonl    append-only trade records
//   <data_dir>/<trader_id>/decisions.jsonl append-only cycle records
//
// state.json uses the atomic tmp + rename pattern; the JSONL files are
// append-only so a crash can at worst lose the final line. Corrupt lines are
// skipped with a warning on read, never propagated.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::record::CycleRecord;
use crate::types::{position_key, PositionSide, TradeKind};

// ---------------------------------------------------------------------------
// Persisted shapes
// ---------------------------------------------------------------------------

/// One trade event: open, close, partial close, emergency close, or a
/// reconciled exchange-side close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub trader_id: String,
    #[serde(default)]
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub kind: TradeKind,
    pub quantity: f64,
    pub price: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub pnl_pct: f64,
    /// ISO 8601.
    pub created_at: String,
    pub created_at_ms: i64,
}

impl TradeRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trader_id: impl Into<String>,
        symbol: impl Into<String>,
        side: PositionSide,
        kind: TradeKind,
        quantity: f64,
        price: f64,
        reason: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trader_id: trader_id.into(),
            user_id: String::new(),
            symbol: symbol.into(),
            side,
            kind,
            quantity,
            price,
            reason: reason.into(),
            stop_loss: 0.0,
            take_profit: 0.0,
            pnl: 0.0,
            pnl_pct: 0.0,
            created_at: now.to_rfc3339(),
            created_at_ms: now.timestamp_millis(),
        }
    }

    pub fn with_protection(mut self, stop_loss: f64, take_profit: f64) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_pnl(mut self, pnl: f64, pnl_pct: f64) -> Self {
        self.pnl = pnl;
        self.pnl_pct = pnl_pct;
        self
    }
}

/// Snapshot of a trader's restorable counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderStateSnapshot {
    #[serde(default)]
    pub user_id: String,
    pub call_count: u64,
    pub peak_equity: f64,
    /// Milliseconds since epoch of the last daily reset.
    pub last_reset_ms: i64,
    /// Free-form JSON for anything the engine wants to carry across restarts.
    #[serde(default)]
    pub state_blob: serde_json::Value,
}

/// The store's view of a position that opened and never closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpenPositionRecord {
    pub first_seen_ms: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Aggregate of recent trading history, fed back into the prompt context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub cycles: usize,
    pub closed_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
}

// ---------------------------------------------------------------------------
// Store capability
// ---------------------------------------------------------------------------

/// Persistence as the engine sees it. Implementations must be cheap enough
/// to call from inside a cycle.
pub trait Store: Send + Sync {
    fn load_trader_state(&self, trader_id: &str) -> Result<Option<TraderStateSnapshot>>;

    fn save_trader_state(&self, trader_id: &str, state: &TraderStateSnapshot) -> Result<()>;

    /// Positions the trade history says are still open, keyed by
    /// `<symbol>_<side>`.
    fn open_positions_from_history(
        &self,
        trader_id: &str,
    ) -> Result<HashMap<String, OpenPositionRecord>>;

    /// Keys of positions the history says are still open.
    fn open_position_keys(&self, trader_id: &str) -> Result<Vec<String>> {
        Ok(self
            .open_positions_from_history(trader_id)?
            .into_keys()
            .collect())
    }

    /// Entry price and quantity of the most recent OPEN trade for
    /// `(symbol, side)`.
    fn last_open_trade(
        &self,
        trader_id: &str,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<(f64, f64)>>;

    fn record_trade(&self, trade: &TradeRecord) -> Result<()>;

    fn log_decision(&self, record: &CycleRecord) -> Result<()>;

    fn analyze_performance(&self, trader_id: &str, last_n: usize) -> Result<PerformanceSummary>;
}

// ---------------------------------------------------------------------------
// History replay (shared by both stores)
// ---------------------------------------------------------------------------

/// Replay a chronological trade list into the set of still-open positions.
fn replay_open_positions(trades: &[TradeRecord]) -> HashMap<String, OpenPositionRecord> {
    let mut open: HashMap<String, OpenPositionRecord> = HashMap::new();

    for trade in trades {
        let key = position_key(&trade.symbol, trade.side);
        match trade.kind {
            TradeKind::Open => {
                open.insert(
                    key,
                    OpenPositionRecord {
                        first_seen_ms: trade.created_at_ms,
                        stop_loss: trade.stop_loss,
                        take_profit: trade.take_profit,
                    },
                );
            }
            TradeKind::Close | TradeKind::EmergencyClose | TradeKind::AutoClose => {
                open.remove(&key);
            }
            // The position survives a partial close.
            TradeKind::PartialClose => {}
        }
    }

    open
}

fn summarize(trades: &[TradeRecord], cycles: usize, last_n: usize) -> PerformanceSummary {
    let closing: Vec<&TradeRecord> = trades
        .iter()
        .filter(|t| t.kind != TradeKind::Open)
        .collect();
    let recent = &closing[closing.len().saturating_sub(last_n)..];

    let wins = recent.iter().filter(|t| t.pnl > 0.0).count();
    let losses = recent.iter().filter(|t| t.pnl < 0.0).count();
    let total_pnl: f64 = recent.iter().map(|t| t.pnl).sum();
    let win_rate = if recent.is_empty() {
        0.0
    } else {
        wins as f64 / recent.len() as f64
    };

    PerformanceSummary {
        cycles,
        closed_trades: recent.len(),
        wins,
        losses,
        win_rate,
        total_pnl,
    }
}

fn find_last_open(
    trades: &[TradeRecord],
    symbol: &str,
    side: PositionSide,
) -> Option<(f64, f64)> {
    trades
        .iter()
        .rev()
        .find(|t| t.kind == TradeKind::Open && t.symbol == symbol && t.side == side)
        .map(|t| (t.price, t.quantity))
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// JSON-on-disk store, one directory per trader.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn trader_dir(&self, trader_id: &str) -> PathBuf {
        self.root.join(trader_id)
    }

    fn state_path(&self, trader_id: &str) -> PathBuf {
        self.trader_dir(trader_id).join("state.json")
    }

    fn trades_path(&self, trader_id: &str) -> PathBuf {
        self.trader_dir(trader_id).join("trades.jsonl")
    }

    fn decisions_path(&self, trader_id: &str) -> PathBuf {
        self.trader_dir(trader_id).join("decisions.jsonl")
    }

    fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let line = serde_json::to_string(value).context("failed to serialise record")?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {} for append", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }

    fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let mut out = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => out.push(value),
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "skipping corrupt record line"
                ),
            }
        }
        Ok(out)
    }

    fn read_trades(&self, trader_id: &str) -> Result<Vec<TradeRecord>> {
        Self::read_jsonl(&self.trades_path(trader_id))
    }
}

impl Store for FileStore {
    fn load_trader_state(&self, trader_id: &str) -> Result<Option<TraderStateSnapshot>> {
        let path = self.state_path(trader_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let state = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(state))
    }

    fn save_trader_state(&self, trader_id: &str, state: &TraderStateSnapshot) -> Result<()> {
        let path = self.state_path(trader_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let content =
            serde_json::to_string_pretty(state).context("failed to serialise trader state")?;

        // Atomic write: tmp sibling, then rename.
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        debug!(trader_id, call_count = state.call_count, "trader state saved");
        Ok(())
    }

    fn open_positions_from_history(
        &self,
        trader_id: &str,
    ) -> Result<HashMap<String, OpenPositionRecord>> {
        Ok(replay_open_positions(&self.read_trades(trader_id)?))
    }

    fn last_open_trade(
        &self,
        trader_id: &str,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<(f64, f64)>> {
        Ok(find_last_open(&self.read_trades(trader_id)?, symbol, side))
    }

    fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        Self::append_jsonl(&self.trades_path(&trade.trader_id), trade)
    }

    fn log_decision(&self, record: &CycleRecord) -> Result<()> {
        Self::append_jsonl(&self.decisions_path(&record.trader_id), record)
    }

    fn analyze_performance(&self, trader_id: &str, last_n: usize) -> Result<PerformanceSummary> {
        let trades = self.read_trades(trader_id)?;
        let cycles: Vec<CycleRecord> = Self::read_jsonl(&self.decisions_path(trader_id))?;
        Ok(summarize(&trades, cycles.len(), last_n))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    states: HashMap<String, TraderStateSnapshot>,
    trades: HashMap<String, Vec<TradeRecord>>,
    decisions: HashMap<String, Vec<CycleRecord>>,
}

/// In-memory store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All trades recorded for `trader_id`, in order.
    pub fn trades(&self, trader_id: &str) -> Vec<TradeRecord> {
        self.inner
            .read()
            .trades
            .get(trader_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All cycle records logged for `trader_id`, in order.
    pub fn cycles(&self, trader_id: &str) -> Vec<CycleRecord> {
        self.inner
            .read()
            .decisions
            .get(trader_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Store for MemoryStore {
    fn load_trader_state(&self, trader_id: &str) -> Result<Option<TraderStateSnapshot>> {
        Ok(self.inner.read().states.get(trader_id).cloned())
    }

    fn save_trader_state(&self, trader_id: &str, state: &TraderStateSnapshot) -> Result<()> {
        self.inner
            .write()
            .states
            .insert(trader_id.to_string(), state.clone());
        Ok(())
    }

    fn open_positions_from_history(
        &self,
        trader_id: &str,
    ) -> Result<HashMap<String, OpenPositionRecord>> {
        Ok(replay_open_positions(
            self.inner
                .read()
                .trades
                .get(trader_id)
                .map(|v| v.as_slice())
                .unwrap_or(&[]),
        ))
    }

    fn last_open_trade(
        &self,
        trader_id: &str,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<(f64, f64)>> {
        Ok(find_last_open(
            self.inner
                .read()
                .trades
                .get(trader_id)
                .map(|v| v.as_slice())
                .unwrap_or(&[]),
            symbol,
            side,
        ))
    }

    fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.inner
            .write()
            .trades
            .entry(trade.trader_id.clone())
            .or_default()
            .push(trade.clone());
        Ok(())
    }

    fn log_decision(&self, record: &CycleRecord) -> Result<()> {
        self.inner
            .write()
            .decisions
            .entry(record.trader_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn analyze_performance(&self, trader_id: &str, last_n: usize) -> Result<PerformanceSummary> {
        let inner = self.inner.read();
        let trades = inner
            .trades
            .get(trader_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        let cycles = inner.decisions.get(trader_id).map(|v| v.len()).unwrap_or(0);
        Ok(summarize(trades, cycles, last_n))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn open_trade(trader: &str, symbol: &str, side: PositionSide, price: f64, qty: f64) -> TradeRecord {
        TradeRecord::new(trader, symbol, side, TradeKind::Open, qty, price, "entry")
            .with_protection(price * 0.98, price * 1.04)
    }

    #[test]
    fn replay_tracks_open_and_close() {
        let trades = vec![
            open_trade("t", "BTCUSDT", PositionSide::Long, 50000.0, 0.01),
            open_trade("t", "ETHUSDT", PositionSide::Short, 3000.0, 1.0),
            TradeRecord::new(
                "t",
                "BTCUSDT",
                PositionSide::Long,
                TradeKind::Close,
                0.01,
                51000.0,
                "model close",
            ),
        ];
        let open = replay_open_positions(&trades);
        assert_eq!(open.len(), 1);
        assert!(open.contains_key("ETHUSDT_short"));
    }

    #[test]
    fn replay_keeps_position_through_partial_close() {
        let trades = vec![
            open_trade("t", "ETHUSDT", PositionSide::Long, 3000.0, 2.0),
            TradeRecord::new(
                "t",
                "ETHUSDT",
                PositionSide::Long,
                TradeKind::PartialClose,
                1.0,
                3100.0,
                "half off",
            ),
        ];
        let open = replay_open_positions(&trades);
        assert!(open.contains_key("ETHUSDT_long"));
    }

    #[test]
    fn memory_store_last_open_trade() {
        let store = MemoryStore::new();
        store
            .record_trade(&open_trade("t", "BTCUSDT", PositionSide::Long, 48000.0, 0.02))
            .unwrap();
        store
            .record_trade(&open_trade("t", "BTCUSDT", PositionSide::Long, 50000.0, 0.01))
            .unwrap();

        let last = store
            .last_open_trade("t", "BTCUSDT", PositionSide::Long)
            .unwrap()
            .unwrap();
        assert_eq!(last, (50000.0, 0.01));

        assert!(store
            .last_open_trade("t", "BTCUSDT", PositionSide::Short)
            .unwrap()
            .is_none());
    }

    #[test]
    fn performance_summary_counts_wins_and_losses() {
        let store = MemoryStore::new();
        let t = "t";
        store.record_trade(&open_trade(t, "A", PositionSide::Long, 10.0, 1.0)).unwrap();
        store
            .record_trade(
                &TradeRecord::new(t, "A", PositionSide::Long, TradeKind::Close, 1.0, 12.0, "tp")
                    .with_pnl(2.0, 20.0),
            )
            .unwrap();
        store
            .record_trade(
                &TradeRecord::new(t, "B", PositionSide::Short, TradeKind::AutoClose, 1.0, 9.0, "sl")
                    .with_pnl(-1.0, -10.0),
            )
            .unwrap();

        let summary = store.analyze_performance(t, 10).unwrap();
        assert_eq!(summary.closed_trades, 2);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.losses, 1);
        assert!((summary.win_rate - 0.5).abs() < 1e-9);
        assert!((summary.total_pnl - 1.0).abs() < 1e-9);
    }

    #[test]
    fn file_store_roundtrips_state_and_trades() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.load_trader_state("t1").unwrap().is_none());

        let state = TraderStateSnapshot {
            user_id: String::new(),
            call_count: 7,
            peak_equity: 1234.5,
            last_reset_ms: 1_700_000_000_000,
            state_blob: serde_json::json!({"note": "x"}),
        };
        store.save_trader_state("t1", &state).unwrap();

        let loaded = store.load_trader_state("t1").unwrap().unwrap();
        assert_eq!(loaded.call_count, 7);
        assert_eq!(loaded.peak_equity, 1234.5);
        assert_eq!(loaded.state_blob["note"], "x");

        store
            .record_trade(&open_trade("t1", "BTCUSDT", PositionSide::Long, 50000.0, 0.01))
            .unwrap();
        let open = store.open_positions_from_history("t1").unwrap();
        assert!(open.contains_key("BTCUSDT_long"));
        assert!((open["BTCUSDT_long"].stop_loss - 49000.0).abs() < 1.0);
    }

    #[test]
    fn file_store_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store
            .record_trade(&open_trade("t1", "BTCUSDT", PositionSide::Long, 50000.0, 0.01))
            .unwrap();

        // Corrupt the log by hand.
        let path = dir.path().join("t1").join("trades.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        store
            .record_trade(&open_trade("t1", "ETHUSDT", PositionSide::Short, 3000.0, 1.0))
            .unwrap();

        let open = store.open_positions_from_history("t1").unwrap();
        assert_eq!(open.len(), 2);
    }

    #[test]
    fn file_store_logs_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.log_decision(&CycleRecord::begin("t1", 1)).unwrap();
        store.log_decision(&CycleRecord::begin("t1", 2)).unwrap();

        let summary = store.analyze_performance("t1", 10).unwrap();
        assert_eq!(summary.cycles, 2);
    }
}
