// =============================================================================
// Nebula Perps Engine — Main Entry Point
// =============================================================================
//
// One process hosts any number of independent traders. Each trader gets its
// own venue adapter, model client, and store, and runs two background
// activities (main loop + drawdown monitor) until ctrl-c.
//
// With no config file present the engine starts a single paper trader so a
// fresh checkout is runnable without touching real funds.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod autotrader;
mod balance;
mod coins;
mod config;
mod exchange;
mod llm;
mod market;
mod persistence;
mod record;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::autotrader::AutoTrader;
use crate::coins::HttpCandidateProvider;
use crate::config::{EngineConfig, TraderConfig};
use crate::exchange::cache::CachedExchange;
use crate::exchange::paper::PaperExchange;
use crate::exchange::Exchange;
use crate::llm::HttpDecisionClient;
use crate::market::{HttpMarketData, MarketData};
use crate::persistence::FileStore;

/// Public futures REST endpoint used by the bundled market-data source.
const DEFAULT_MARKET_URL: &str = "https://fapi.binance.com";

/// Default OpenAI-compatible endpoint when a trader does not set one.
const DEFAULT_MODEL_URL: &str = "https://api.deepseek.com";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Nebula Perps Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("NEBULA_CONFIG").unwrap_or_else(|_| "nebula_config.json".into());

    let mut engine_config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config — using defaults");
        EngineConfig::default()
    });

    // SAFETY: with nothing configured, run one paper trader. Real venues
    // must be configured explicitly.
    if engine_config.traders.is_empty() {
        warn!("no traders configured — starting a single paper trader");
        engine_config.traders.push(TraderConfig::paper("paper-1", 10_000.0));
    }

    overlay_secrets_from_env(&mut engine_config);
    engine_config.validate()?;

    // ── 2. Shared collaborators ──────────────────────────────────────────
    let market: Arc<dyn MarketData> = Arc::new(HttpMarketData::new(DEFAULT_MARKET_URL));
    let store = Arc::new(FileStore::new(engine_config.data_dir.clone()));

    // ── 3. Build and launch traders ──────────────────────────────────────
    let mut traders: Vec<Arc<AutoTrader>> = Vec::new();

    for trader_config in &engine_config.traders {
        let venue = build_venue(trader_config, &market)?;

        let model_url = if trader_config.model_base_url.is_empty() {
            DEFAULT_MODEL_URL.to_string()
        } else {
            trader_config.model_base_url.clone()
        };
        let model = Arc::new(HttpDecisionClient::new(
            model_url,
            trader_config.model_api_key.clone(),
            trader_config.model_name.clone(),
        ));

        let candidates = Arc::new(HttpCandidateProvider::new(
            trader_config.coin_pool_url.clone(),
            trader_config.oi_top_url.clone(),
        ));

        let trader = Arc::new(AutoTrader::new(
            trader_config.clone(),
            venue,
            model,
            store.clone(),
            Some(market.clone()),
            candidates,
        )?);

        info!(
            trader_id = %trader_config.id,
            venue = %trader_config.venue,
            model = %trader_config.model_name,
            scan_interval_secs = trader_config.scan_interval_secs,
            "trader launched"
        );

        tokio::spawn(trader.clone().run());
        traders.push(trader);
    }

    info!(count = traders.len(), "all traders running. Press Ctrl+C to stop.");

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping traders");

    for trader in &traders {
        trader.stop().await;
    }

    info!("Nebula Perps Engine shut down complete.");
    Ok(())
}

/// Construct the venue adapter named by the trader config, wrapped in the
/// TTL-caching layer.
fn build_venue(
    config: &TraderConfig,
    market: &Arc<dyn MarketData>,
) -> anyhow::Result<Arc<dyn Exchange>> {
    match config.venue.as_str() {
        "paper" => {
            let paper = Arc::new(PaperExchange::new(config.initial_balance));

            // The paper book needs mark prices; mirror them from the public
            // market-data source so demo fills track the real market.
            let symbols: Vec<String> = if config.trading_coins.is_empty() {
                config.default_coins.clone()
            } else {
                config.trading_coins.clone()
            };
            tokio::spawn(sync_paper_marks(paper.clone(), market.clone(), symbols));

            Ok(Arc::new(CachedExchange::new(paper)))
        }
        other => anyhow::bail!(
            "unknown venue '{other}' for trader {}: only 'paper' ships in this build; \
             real venue adapters register here",
            config.id
        ),
    }
}

/// Keep a paper venue's mark prices in sync with the public market feed.
async fn sync_paper_marks(
    paper: Arc<PaperExchange>,
    market: Arc<dyn MarketData>,
    symbols: Vec<String>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        ticker.tick().await;
        for symbol in &symbols {
            match market.snapshot(symbol, &[]).await {
                Ok(snapshot) if snapshot.current_price > 0.0 => {
                    paper.set_mark_price(symbol, snapshot.current_price);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "paper mark-price sync failed");
                }
            }
        }
    }
}

/// Pull venue and model API keys from the environment so they never live in
/// the JSON config file.
fn overlay_secrets_from_env(config: &mut EngineConfig) {
    for trader in &mut config.traders {
        let prefix = format!("NEBULA_{}", trader.id.to_uppercase().replace('-', "_"));

        if let Ok(key) = std::env::var(format!("{prefix}_API_KEY")) {
            trader.api_key = key;
        }
        if let Ok(secret) = std::env::var(format!("{prefix}_API_SECRET")) {
            trader.api_secret = secret;
        }
        if let Ok(model_key) = std::env::var(format!("{prefix}_MODEL_KEY")) {
            trader.model_api_key = model_key;
        } else if let Ok(model_key) = std::env::var("NEBULA_MODEL_KEY") {
            if trader.model_api_key.is_empty() {
                trader.model_api_key = model_key;
            }
        }
    }
}
