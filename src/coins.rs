// =============================================================================
// Candidate Coins — signal sources and per-cycle pool resolution
// =============================================================================
//
// Each cycle the engine offers the model a universe of candidate symbols.
// The universe comes from, in order of precedence:
//
//   1. the trader's custom list (source tag "custom"),
//   2. the default list plus top entries from each enabled signal source
//      ("default" + "ai500" / "oi_top"), union-merged per symbol,
//   3. the default list alone,
//   4. nothing — the model then only manages existing positions.
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TraderConfig;

/// Source tags attached to candidates so the model knows why a symbol is
/// on the list.
pub const SOURCE_CUSTOM: &str = "custom";
pub const SOURCE_DEFAULT: &str = "default";
pub const SOURCE_AI500: &str = "ai500";
pub const SOURCE_OI_TOP: &str = "oi_top";

/// How many symbols to take from each signal source.
const SOURCE_LIMIT: usize = 10;

/// A symbol offered to the model, with every source that nominated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCoin {
    pub symbol: String,
    pub sources: Vec<String>,
}

// ---------------------------------------------------------------------------
// Signal-source capability
// ---------------------------------------------------------------------------

/// External rating / open-interest signal sources.
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    /// Top-rated symbols (the "ai500" pool), best first.
    async fn top_rated(&self, limit: usize) -> Result<Vec<String>>;

    /// Symbols with the largest open-interest positions.
    async fn oi_top(&self) -> Result<Vec<String>>;
}

/// Merged pool across both sources: symbol → nominating sources.
pub async fn merged_coin_pool(
    provider: &dyn CandidateProvider,
    limit: usize,
) -> Result<BTreeMap<String, Vec<String>>> {
    let mut pool: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for symbol in provider.top_rated(limit).await? {
        pool.entry(normalize_symbol(&symbol))
            .or_default()
            .push(SOURCE_AI500.to_string());
    }
    for symbol in provider.oi_top().await? {
        let entry = pool.entry(normalize_symbol(&symbol)).or_default();
        if !entry.iter().any(|s| s == SOURCE_OI_TOP) {
            entry.push(SOURCE_OI_TOP.to_string());
        }
    }

    Ok(pool)
}

// ---------------------------------------------------------------------------
// Per-cycle resolution
// ---------------------------------------------------------------------------

/// Resolve this cycle's candidate universe for `config`.
///
/// Signal-source failures degrade gracefully: the affected source is skipped
/// with a warning and resolution continues with what remains.
pub async fn resolve_candidates(
    config: &TraderConfig,
    provider: &dyn CandidateProvider,
) -> Vec<CandidateCoin> {
    // 1. Custom list wins outright.
    if !config.trading_coins.is_empty() {
        return tag_all(&config.trading_coins, SOURCE_CUSTOM);
    }

    // 2. Signal sources over the default list.
    if config.use_coin_pool || config.use_oi_top {
        let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for symbol in &config.default_coins {
            merged
                .entry(normalize_symbol(symbol))
                .or_default()
                .push(SOURCE_DEFAULT.to_string());
        }

        if config.use_coin_pool {
            match provider.top_rated(SOURCE_LIMIT).await {
                Ok(symbols) => merge_source(&mut merged, &symbols, SOURCE_AI500),
                Err(e) => warn!(error = %e, "top-rated coin source unavailable"),
            }
        }
        if config.use_oi_top {
            match provider.oi_top().await {
                Ok(symbols) => {
                    let top: Vec<String> = symbols.into_iter().take(SOURCE_LIMIT).collect();
                    merge_source(&mut merged, &top, SOURCE_OI_TOP);
                }
                Err(e) => warn!(error = %e, "open-interest coin source unavailable"),
            }
        }

        let candidates: Vec<CandidateCoin> = merged
            .into_iter()
            .map(|(symbol, sources)| CandidateCoin { symbol, sources })
            .collect();
        debug!(count = candidates.len(), "candidate pool resolved from signal sources");
        return candidates;
    }

    // 3. Default list alone.
    if !config.default_coins.is_empty() {
        return tag_all(&config.default_coins, SOURCE_DEFAULT);
    }

    // 4. Nothing configured: manage existing positions only.
    Vec::new()
}

fn tag_all(symbols: &[String], source: &str) -> Vec<CandidateCoin> {
    symbols
        .iter()
        .map(|s| CandidateCoin {
            symbol: normalize_symbol(s),
            sources: vec![source.to_string()],
        })
        .collect()
}

fn merge_source(merged: &mut BTreeMap<String, Vec<String>>, symbols: &[String], source: &str) {
    for symbol in symbols {
        let entry = merged.entry(normalize_symbol(symbol)).or_default();
        if !entry.iter().any(|s| s == source) {
            entry.push(source.to_string());
        }
    }
}

/// Normalise a coin name to the exchange's symbol form: uppercase, USDT
/// quoted ("btc" → "BTCUSDT", "ETHUSDT" unchanged).
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    if upper.ends_with("USDT") {
        upper
    } else {
        format!("{upper}USDT")
    }
}

// ---------------------------------------------------------------------------
// HTTP signal sources
// ---------------------------------------------------------------------------

const DEFAULT_COIN_POOL_URL: &str = "https://api.nebula.trade/v1/coins/top";
const DEFAULT_OI_TOP_URL: &str = "https://api.nebula.trade/v1/oi/top";

/// Signal sources over HTTP, with per-trader URL overrides.
pub struct HttpCandidateProvider {
    coin_pool_url: String,
    oi_top_url: String,
    client: reqwest::Client,
}

impl HttpCandidateProvider {
    pub fn new(coin_pool_url: Option<String>, oi_top_url: Option<String>) -> Self {
        Self {
            coin_pool_url: coin_pool_url.unwrap_or_else(|| DEFAULT_COIN_POOL_URL.to_string()),
            oi_top_url: oi_top_url.unwrap_or_else(|| DEFAULT_OI_TOP_URL.to_string()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    async fn fetch_symbol_list(&self, url: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse symbol-list response")?;

        if !status.is_success() {
            anyhow::bail!("symbol-list API returned {}: {}", status, body);
        }

        // Accept either a bare array or {"symbols": [...]}.
        let raw = body
            .as_array()
            .or_else(|| body["symbols"].as_array())
            .context("symbol-list response has no array")?;

        Ok(raw
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect())
    }
}

#[async_trait]
impl CandidateProvider for HttpCandidateProvider {
    async fn top_rated(&self, limit: usize) -> Result<Vec<String>> {
        let mut symbols = self.fetch_symbol_list(&self.coin_pool_url).await?;
        symbols.truncate(limit);
        Ok(symbols)
    }

    async fn oi_top(&self) -> Result<Vec<String>> {
        self.fetch_symbol_list(&self.oi_top_url).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        rated: Vec<&'static str>,
        oi: Vec<&'static str>,
        fail_rated: bool,
    }

    #[async_trait]
    impl CandidateProvider for FakeProvider {
        async fn top_rated(&self, limit: usize) -> Result<Vec<String>> {
            if self.fail_rated {
                anyhow::bail!("source down");
            }
            Ok(self.rated.iter().take(limit).map(|s| s.to_string()).collect())
        }

        async fn oi_top(&self) -> Result<Vec<String>> {
            Ok(self.oi.iter().map(|s| s.to_string()).collect())
        }
    }

    fn base_config() -> TraderConfig {
        TraderConfig::paper("t1", 1000.0)
    }

    #[test]
    fn normalize_appends_quote() {
        assert_eq!(normalize_symbol("btc"), "BTCUSDT");
        assert_eq!(normalize_symbol("ETHUSDT"), "ETHUSDT");
        assert_eq!(normalize_symbol(" sol "), "SOLUSDT");
    }

    #[tokio::test]
    async fn custom_list_wins() {
        let mut cfg = base_config();
        cfg.trading_coins = vec!["BTCUSDT".into(), "DOGEUSDT".into()];
        cfg.use_coin_pool = true;

        let provider = FakeProvider {
            rated: vec!["SOLUSDT"],
            oi: vec![],
            fail_rated: false,
        };
        let out = resolve_candidates(&cfg, &provider).await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.sources == vec![SOURCE_CUSTOM]));
    }

    #[tokio::test]
    async fn signal_sources_union_merge_over_defaults() {
        let mut cfg = base_config();
        cfg.default_coins = vec!["BTCUSDT".into()];
        cfg.use_coin_pool = true;
        cfg.use_oi_top = true;

        let provider = FakeProvider {
            rated: vec!["BTCUSDT", "SOLUSDT"],
            oi: vec!["SOLUSDT", "APTUSDT"],
            fail_rated: false,
        };
        let out = resolve_candidates(&cfg, &provider).await;

        let btc = out.iter().find(|c| c.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.sources, vec![SOURCE_DEFAULT, SOURCE_AI500]);

        let sol = out.iter().find(|c| c.symbol == "SOLUSDT").unwrap();
        assert_eq!(sol.sources, vec![SOURCE_AI500, SOURCE_OI_TOP]);

        let apt = out.iter().find(|c| c.symbol == "APTUSDT").unwrap();
        assert_eq!(apt.sources, vec![SOURCE_OI_TOP]);
    }

    #[tokio::test]
    async fn failed_source_degrades_gracefully() {
        let mut cfg = base_config();
        cfg.default_coins = vec!["BTCUSDT".into()];
        cfg.use_coin_pool = true;
        cfg.use_oi_top = true;

        let provider = FakeProvider {
            rated: vec![],
            oi: vec!["APTUSDT"],
            fail_rated: true,
        };
        let out = resolve_candidates(&cfg, &provider).await;
        assert_eq!(out.len(), 2); // BTCUSDT (default) + APTUSDT (oi_top)
    }

    #[tokio::test]
    async fn default_list_when_no_sources_enabled() {
        let cfg = base_config();
        let provider = FakeProvider {
            rated: vec!["SOLUSDT"],
            oi: vec!["APTUSDT"],
            fail_rated: false,
        };
        let out = resolve_candidates(&cfg, &provider).await;
        assert_eq!(out.len(), cfg.default_coins.len());
        assert!(out.iter().all(|c| c.sources == vec![SOURCE_DEFAULT]));
    }

    #[tokio::test]
    async fn empty_configuration_yields_empty_pool() {
        let mut cfg = base_config();
        cfg.default_coins.clear();
        let provider = FakeProvider {
            rated: vec![],
            oi: vec![],
            fail_rated: false,
        };
        assert!(resolve_candidates(&cfg, &provider).await.is_empty());
    }

    #[tokio::test]
    async fn merged_pool_tags_both_sources() {
        let provider = FakeProvider {
            rated: vec!["BTCUSDT", "ETHUSDT"],
            oi: vec!["ETHUSDT"],
            fail_rated: false,
        };
        let pool = merged_coin_pool(&provider, 10).await.unwrap();
        assert_eq!(pool["BTCUSDT"], vec![SOURCE_AI500]);
        assert_eq!(pool["ETHUSDT"], vec![SOURCE_AI500, SOURCE_OI_TOP]);
    }
}
