// =============================================================================
// Engine Configuration — per-trader settings with atomic save
// =============================================================================
//
// One engine process hosts any number of independent traders; each trader
// carries its own venue, model, risk limits, and candidate-coin sources.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. Secrets (venue and model API
// keys) are overlaid from the environment at startup and are never written
// back to disk.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_venue() -> String {
    "paper".to_string()
}

fn default_model_name() -> String {
    "deepseek-chat".to_string()
}

fn default_scan_interval_secs() -> u64 {
    180
}

fn default_btc_eth_leverage() -> u32 {
    5
}

fn default_altcoin_leverage() -> u32 {
    5
}

fn default_taker_fee_rate() -> f64 {
    0.0004
}

fn default_maker_fee_rate() -> f64 {
    0.0002
}

fn default_default_coins() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
    ]
}

fn default_prompt_template() -> String {
    "default".to_string()
}

fn default_timeframes() -> Vec<String> {
    vec!["15m".to_string(), "1h".to_string(), "4h".to_string()]
}

fn default_limit_price_offset_pct() -> f64 {
    -0.05
}

fn default_limit_timeout_secs() -> u64 {
    30
}

fn default_stop_trading_minutes() -> i64 {
    60
}

fn default_data_dir() -> String {
    "data".to_string()
}

// =============================================================================
// Order strategy
// =============================================================================

/// How opening orders reach the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStrategy {
    /// Single market order.
    MarketOnly,
    /// Limit order first; converted to a market order if unfilled after the
    /// timeout.
    ConservativeHybrid,
    /// Single limit order at the configured offset; never monitored.
    LimitOnly,
}

impl Default for OrderStrategy {
    fn default() -> Self {
        Self::MarketOnly
    }
}

impl std::fmt::Display for OrderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MarketOnly => write!(f, "market_only"),
            Self::ConservativeHybrid => write!(f, "conservative_hybrid"),
            Self::LimitOnly => write!(f, "limit_only"),
        }
    }
}

// =============================================================================
// TraderConfig
// =============================================================================

/// Complete configuration for one trader. Immutable during a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    // --- Identity -----------------------------------------------------------
    pub id: String,

    #[serde(default)]
    pub name: String,

    // --- Venue --------------------------------------------------------------
    /// Venue selector, e.g. "paper". Concrete adapters register by name.
    #[serde(default = "default_venue")]
    pub venue: String,

    /// Venue API credentials. Overlaid from `NEBULA_<ID>_API_KEY` /
    /// `NEBULA_<ID>_API_SECRET` when present; never persisted back to disk.
    #[serde(default, skip_serializing)]
    pub api_key: String,

    #[serde(default, skip_serializing)]
    pub api_secret: String,

    // --- Model --------------------------------------------------------------
    #[serde(default = "default_model_name")]
    pub model_name: String,

    #[serde(default, skip_serializing)]
    pub model_api_key: String,

    /// OpenAI-compatible endpoint base, e.g. "https://api.deepseek.com".
    #[serde(default)]
    pub model_base_url: String,

    /// Prompt template selector handed to the model client.
    #[serde(default = "default_prompt_template")]
    pub system_prompt_template: String,

    // --- Scheduling ---------------------------------------------------------
    /// Main-loop tick period in seconds.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    // --- Account baseline ---------------------------------------------------
    /// Baseline for total P&L computations. Must be > 0.
    #[serde(default)]
    pub initial_balance: f64,

    // --- Leverage & fees ----------------------------------------------------
    /// Default leverage hint for BTC/ETH, passed to the model.
    #[serde(default = "default_btc_eth_leverage")]
    pub btc_eth_leverage: u32,

    /// Default leverage hint for everything else.
    #[serde(default = "default_altcoin_leverage")]
    pub altcoin_leverage: u32,

    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: f64,

    #[serde(default = "default_maker_fee_rate")]
    pub maker_fee_rate: f64,

    /// Cross margin when true, isolated when false. Sent to the venue on
    /// every open.
    #[serde(default = "default_true")]
    pub is_cross_margin: bool,

    // --- Candidate coins ----------------------------------------------------
    /// Fallback universe when no custom list or signal source applies.
    #[serde(default = "default_default_coins")]
    pub default_coins: Vec<String>,

    /// Custom list; when non-empty it wins over every other source.
    #[serde(default)]
    pub trading_coins: Vec<String>,

    #[serde(default)]
    pub use_coin_pool: bool,

    #[serde(default)]
    pub use_oi_top: bool,

    /// Optional per-trader URL overrides for the signal sources.
    #[serde(default)]
    pub coin_pool_url: Option<String>,

    #[serde(default)]
    pub oi_top_url: Option<String>,

    // --- Market data --------------------------------------------------------
    /// K-line timeframes fetched for prompt context, passed through unchanged.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,

    // --- Order strategy -----------------------------------------------------
    #[serde(default)]
    pub order_strategy: OrderStrategy,

    /// Limit-price offset in percent. Negative means below market for longs
    /// (maker-friendly); mirrored for shorts.
    #[serde(default = "default_limit_price_offset_pct")]
    pub limit_price_offset_pct: f64,

    /// Seconds before an unfilled hybrid limit order falls back to market.
    #[serde(default = "default_limit_timeout_secs")]
    pub limit_timeout_secs: u64,

    // --- Risk limits --------------------------------------------------------
    /// Daily loss limit as a percent of the daily baseline. 0 disables.
    #[serde(default)]
    pub max_daily_loss_pct: f64,

    /// Peak-equity drawdown limit in percent. 0 disables.
    #[serde(default)]
    pub max_drawdown_pct: f64,

    /// How long trading stays paused after a risk limit trips.
    #[serde(default = "default_stop_trading_minutes")]
    pub stop_trading_minutes: i64,
}

impl TraderConfig {
    /// Minimal config for a paper trader. Used by tests and as a template.
    pub fn paper(id: impl Into<String>, initial_balance: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            venue: default_venue(),
            api_key: String::new(),
            api_secret: String::new(),
            model_name: default_model_name(),
            model_api_key: String::new(),
            model_base_url: String::new(),
            system_prompt_template: default_prompt_template(),
            scan_interval_secs: default_scan_interval_secs(),
            initial_balance,
            btc_eth_leverage: default_btc_eth_leverage(),
            altcoin_leverage: default_altcoin_leverage(),
            taker_fee_rate: default_taker_fee_rate(),
            maker_fee_rate: default_maker_fee_rate(),
            is_cross_margin: true,
            default_coins: default_default_coins(),
            trading_coins: Vec::new(),
            use_coin_pool: false,
            use_oi_top: false,
            coin_pool_url: None,
            oi_top_url: None,
            timeframes: default_timeframes(),
            order_strategy: OrderStrategy::default(),
            limit_price_offset_pct: default_limit_price_offset_pct(),
            limit_timeout_secs: default_limit_timeout_secs(),
            max_daily_loss_pct: 0.0,
            max_drawdown_pct: 0.0,
            stop_trading_minutes: default_stop_trading_minutes(),
        }
    }

    /// Validate invariants that would otherwise surface as nonsense P&L or
    /// refused orders deep inside a cycle.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("trader config: id must not be empty");
        }
        if self.initial_balance <= 0.0 {
            anyhow::bail!(
                "trader {}: initial_balance must be > 0 (got {})",
                self.id,
                self.initial_balance
            );
        }
        if self.scan_interval_secs == 0 {
            anyhow::bail!("trader {}: scan_interval_secs must be >= 1", self.id);
        }
        if self.max_daily_loss_pct < 0.0 || self.max_drawdown_pct < 0.0 {
            anyhow::bail!("trader {}: risk limits must not be negative", self.id);
        }
        Ok(())
    }

    /// Leverage hint for `symbol`, passed to the model as a default.
    pub fn default_leverage(&self, symbol: &str) -> u32 {
        if symbol.starts_with("BTC") || symbol.starts_with("ETH") {
            self.btc_eth_leverage
        } else {
            self.altcoin_leverage
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration: the set of traders plus engine-wide paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for per-trader persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub traders: Vec<TraderConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            traders: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            traders = config.traders.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for trader in &self.traders {
            trader.validate()?;
            if !seen.insert(trader.id.as_str()) {
                anyhow::bail!("duplicate trader id: {}", trader.id);
            }
        }
        Ok(())
    }
}
