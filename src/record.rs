// =============================================================================
// Cycle Record — auditable record of every trading cycle
// =============================================================================
//
// Each tick of a trader's main loop produces exactly one CycleRecord: the
// inputs handed to the model, the decisions it returned, the outcome of each
// executed action, and any failure along the way. Records are persisted by
// the store so that every cycle can be audited after the fact.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{CloseReason, Decision, DecisionAction};

/// Why a cycle ended without asking the model for decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Decisions were requested and executed (possibly zero actions).
    Completed,
    /// The trading-pause deadline had not passed yet.
    Paused,
    /// A risk limit tripped this cycle; trading is now paused.
    RiskTripped,
    /// Context assembly or the model call failed.
    Failed,
}

/// A position that disappeared between cycles, with the inferred cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoCloseEvent {
    pub symbol: String,
    pub side: crate::types::PositionSide,
    /// Quantity from the last snapshot of the vanished position.
    pub quantity: f64,
    /// Estimated close price (recorded SL/TP, liquidation price, or last mark).
    pub close_price: f64,
    pub reason: CloseReason,
    pub pnl: f64,
}

/// Outcome of one executed decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: DecisionAction,
    pub symbol: String,
    pub success: bool,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Venue order id, fill detail, or refusal explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActionResult {
    pub fn ok(action: DecisionAction, symbol: impl Into<String>) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            success: true,
            error: None,
            detail: None,
        }
    }

    pub fn ok_with(
        action: DecisionAction,
        symbol: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            success: true,
            error: None,
            detail: Some(detail.into()),
        }
    }

    pub fn failed(
        action: DecisionAction,
        symbol: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            success: false,
            error: Some(error.into()),
            detail: None,
        }
    }
}

/// Complete auditable record of one trading cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Unique identifier for this cycle (UUID v4).
    pub id: String,

    pub trader_id: String,

    /// Monotonic cycle counter (survives restarts via the store).
    pub cycle_number: u64,

    /// ISO 8601 timestamp of when the cycle started.
    pub started_at: String,

    pub outcome: CycleOutcome,

    /// Failure description for `Failed` cycles, or the tripped-limit message
    /// for `RiskTripped` cycles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Positions reconciled as closed by the exchange since the last cycle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_closes: Vec<AutoCloseEvent>,

    /// Decisions returned by the model, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<Decision>,

    /// Per-action execution outcomes, parallel to `decisions`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_results: Vec<ActionResult>,

    /// Prompts sent to the model (kept even when the call fails).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,

    /// Model thinking trace, when the provider returns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    /// Wall-clock duration of the model call in milliseconds.
    #[serde(default)]
    pub model_elapsed_ms: u64,

    /// Account equity observed this cycle (0 when context assembly failed).
    #[serde(default)]
    pub equity: f64,

    /// Daily P&L after this cycle's update.
    #[serde(default)]
    pub daily_pnl: f64,
}

impl CycleRecord {
    /// Start a record for cycle `cycle_number`. Fields are filled in as the
    /// cycle progresses; the record is persisted exactly once at the end.
    pub fn begin(trader_id: impl Into<String>, cycle_number: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trader_id: trader_id.into(),
            cycle_number,
            started_at: chrono::Utc::now().to_rfc3339(),
            outcome: CycleOutcome::Completed,
            error: None,
            auto_closes: Vec::new(),
            decisions: Vec::new(),
            action_results: Vec::new(),
            system_prompt: None,
            user_prompt: None,
            thinking: None,
            model_elapsed_ms: 0,
            equity: 0.0,
            daily_pnl: 0.0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_populates_identity() {
        let rec = CycleRecord::begin("trader-1", 42);
        assert_eq!(rec.trader_id, "trader-1");
        assert_eq!(rec.cycle_number, 42);
        assert_eq!(rec.outcome, CycleOutcome::Completed);
        assert!(!rec.id.is_empty());
        assert!(rec.decisions.is_empty());
    }

    #[test]
    fn empty_collections_are_skipped_in_json() {
        let rec = CycleRecord::begin("t", 1);
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("auto_closes"));
        assert!(!json.contains("action_results"));
        assert!(!json.contains("system_prompt"));
    }

    #[test]
    fn action_result_constructors() {
        let ok = ActionResult::ok(DecisionAction::Hold, "BTCUSDT");
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = ActionResult::failed(DecisionAction::OpenLong, "BTCUSDT", "margin");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("margin"));
    }
}
