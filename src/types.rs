// =============================================================================
// Shared types used across the Nebula trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Position side
// ---------------------------------------------------------------------------

/// Direction of a perpetual-futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1.0 for long, -1.0 for short. Multiplied into price deltas so that
    /// profit is always positive when the market moves in our favour.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Snapshot key for a position: `<symbol>_<side>`.
///
/// All per-position bookkeeping (first-seen time, recorded SL/TP, peak P&L)
/// is indexed by this key. At most one position may exist per key.
pub fn position_key(symbol: &str, side: PositionSide) -> String {
    format!("{symbol}_{side}")
}

/// Inverse of [`position_key`]. Returns `None` for malformed keys.
pub fn parse_position_key(key: &str) -> Option<(String, PositionSide)> {
    let (symbol, side) = key.rsplit_once('_')?;
    let side = match side {
        "long" => PositionSide::Long,
        "short" => PositionSide::Short,
        _ => return None,
    };
    Some((symbol.to_string(), side))
}

// ---------------------------------------------------------------------------
// Model decisions
// ---------------------------------------------------------------------------

/// Action vocabulary the model may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    PartialClose,
    UpdateStopLoss,
    UpdateTakeProfit,
    Hold,
    Wait,
}

impl DecisionAction {
    /// Execution priority: lower runs first.
    ///
    /// Closes must free margin before opens so that same-symbol position
    /// swaps and margin-limit edge cases do not double up.
    pub fn priority(&self) -> u8 {
        match self {
            Self::CloseLong | Self::CloseShort | Self::PartialClose => 1,
            Self::UpdateStopLoss | Self::UpdateTakeProfit => 2,
            Self::OpenLong | Self::OpenShort => 3,
            Self::Hold | Self::Wait => 4,
        }
    }
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
            Self::PartialClose => "partial_close",
            Self::UpdateStopLoss => "update_stop_loss",
            Self::UpdateTakeProfit => "update_take_profit",
            Self::Hold => "hold",
            Self::Wait => "wait",
        };
        write!(f, "{s}")
    }
}

/// A single instruction from the model for one symbol.
///
/// Which fields are meaningful depends on `action`: openings use
/// `position_size_usd` / `leverage` / `stop_loss` / `take_profit`, partial
/// closes use `close_percentage` plus the optional replacement protective
/// prices, and SL/TP adjustments use `new_stop_loss` / `new_take_profit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub symbol: String,

    /// Position size in quote currency (openings only).
    #[serde(default)]
    pub position_size_usd: f64,

    #[serde(default)]
    pub leverage: u32,

    #[serde(default)]
    pub stop_loss: f64,

    #[serde(default)]
    pub take_profit: f64,

    /// Percentage of the position to close, in (0, 100] (partial close only).
    #[serde(default)]
    pub close_percentage: f64,

    #[serde(default)]
    pub new_stop_loss: f64,

    #[serde(default)]
    pub new_take_profit: f64,

    /// Free-text reasoning from the model, echoed into the cycle record.
    #[serde(default)]
    pub reasoning: String,
}

impl Decision {
    /// Bare decision with every numeric field zeroed. Callers fill in what
    /// the action needs.
    pub fn new(action: DecisionAction, symbol: impl Into<String>) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            position_size_usd: 0.0,
            leverage: 0,
            stop_loss: 0.0,
            take_profit: 0.0,
            close_percentage: 0.0,
            new_stop_loss: 0.0,
            new_take_profit: 0.0,
            reasoning: String::new(),
        }
    }

}

/// Stable-sort decisions by the priority ladder.
pub fn sort_decisions(decisions: &mut [Decision]) {
    decisions.sort_by_key(|d| d.action.priority());
}

// ---------------------------------------------------------------------------
// Trade records
// ---------------------------------------------------------------------------

/// Kind of trade event persisted to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeKind {
    Open,
    Close,
    PartialClose,
    EmergencyClose,
    AutoClose,
}

impl std::fmt::Display for TradeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::PartialClose => "PARTIAL_CLOSE",
            Self::EmergencyClose => "EMERGENCY_CLOSE",
            Self::AutoClose => "AUTO_CLOSE",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Canonical position snapshot
// ---------------------------------------------------------------------------

/// In-memory record of a position's last observed state.
///
/// Quantity is always a positive magnitude; direction lives in `side`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    /// Unrealised P&L in quote currency.
    pub unrealized_pnl: f64,
    /// Unrealised P&L as a signed percent of margin.
    pub unrealized_pnl_pct: f64,
    /// Highest P&L percent observed so far for this position.
    #[serde(default)]
    pub peak_pnl_pct: f64,
    #[serde(default)]
    pub liquidation_price: f64,
    /// Margin locked by this position (`quantity * entry / leverage`).
    #[serde(default)]
    pub margin_used: f64,
    /// Milliseconds since epoch of the first cycle that saw this position.
    #[serde(default)]
    pub first_seen_ms: i64,
    /// Stop-loss price recorded when the engine placed the protective order.
    #[serde(default)]
    pub stop_loss: f64,
    /// Take-profit price recorded when the engine placed the protective order.
    #[serde(default)]
    pub take_profit: f64,
}

impl PositionState {
    pub fn key(&self) -> String {
        position_key(&self.symbol, self.side)
    }
}

// ---------------------------------------------------------------------------
// Passive-close reasons
// ---------------------------------------------------------------------------

/// Inferred cause of a position that vanished between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Liquidation,
    StopLoss,
    TakeProfit,
    Unknown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Liquidation => "liquidation",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_key_format() {
        assert_eq!(position_key("BTCUSDT", PositionSide::Long), "BTCUSDT_long");
        assert_eq!(position_key("ETHUSDT", PositionSide::Short), "ETHUSDT_short");
    }

    #[test]
    fn position_key_roundtrips() {
        assert_eq!(
            parse_position_key("BTCUSDT_long"),
            Some(("BTCUSDT".to_string(), PositionSide::Long))
        );
        assert_eq!(
            parse_position_key("ETHUSDT_short"),
            Some(("ETHUSDT".to_string(), PositionSide::Short))
        );
        assert_eq!(parse_position_key("garbage"), None);
        assert_eq!(parse_position_key("BTCUSDT_sideways"), None);
    }

    #[test]
    fn side_sign_and_opposite() {
        assert_eq!(PositionSide::Long.sign(), 1.0);
        assert_eq!(PositionSide::Short.sign(), -1.0);
        assert_eq!(PositionSide::Long.opposite(), PositionSide::Short);
    }

    #[test]
    fn decision_actions_deserialize_snake_case() {
        let d: Decision =
            serde_json::from_str(r#"{"action":"open_long","symbol":"BTCUSDT"}"#).unwrap();
        assert_eq!(d.action, DecisionAction::OpenLong);
        assert_eq!(d.symbol, "BTCUSDT");
        assert_eq!(d.position_size_usd, 0.0);
        assert_eq!(d.leverage, 0);
    }

    #[test]
    fn priority_ladder() {
        assert_eq!(DecisionAction::CloseLong.priority(), 1);
        assert_eq!(DecisionAction::PartialClose.priority(), 1);
        assert_eq!(DecisionAction::UpdateStopLoss.priority(), 2);
        assert_eq!(DecisionAction::UpdateTakeProfit.priority(), 2);
        assert_eq!(DecisionAction::OpenShort.priority(), 3);
        assert_eq!(DecisionAction::Hold.priority(), 4);
        assert_eq!(DecisionAction::Wait.priority(), 4);
    }

    #[test]
    fn sort_is_stable_within_priority() {
        let mut decisions = vec![
            Decision::new(DecisionAction::OpenLong, "A"),
            Decision::new(DecisionAction::Hold, "B"),
            Decision::new(DecisionAction::CloseShort, "C"),
            Decision::new(DecisionAction::UpdateTakeProfit, "D"),
            Decision::new(DecisionAction::PartialClose, "E"),
            Decision::new(DecisionAction::OpenShort, "F"),
        ];
        sort_decisions(&mut decisions);

        let order: Vec<&str> = decisions.iter().map(|d| d.symbol.as_str()).collect();
        // close/partial first (C before E preserved), then updates, then opens
        // (A before F preserved), then hold/wait.
        assert_eq!(order, vec!["C", "E", "D", "A", "F", "B"]);
    }

    #[test]
    fn trade_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&TradeKind::PartialClose).unwrap(),
            "\"PARTIAL_CLOSE\""
        );
        assert_eq!(TradeKind::AutoClose.to_string(), "AUTO_CLOSE");
        assert_eq!(CloseReason::StopLoss.to_string(), "stop_loss");
    }
}
