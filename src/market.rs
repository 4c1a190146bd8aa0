// =============================================================================
// Market Data — current price + k-lines by timeframe
// =============================================================================
//
// The engine consumes market data for two purposes only: prompt context
// (k-lines per configured timeframe) and the optional price-consistency
// check before an open. Timeframes are passed through unchanged.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Everything the market-data source knows about one symbol right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
    /// K-lines keyed by timeframe ("15m", "1h", ...).
    pub klines: HashMap<String, Vec<Kline>>,
}

/// The market-data capability.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn snapshot(&self, symbol: &str, timeframes: &[String]) -> Result<MarketSnapshot>;
}

// ---------------------------------------------------------------------------
// Public-REST implementation
// ---------------------------------------------------------------------------

/// Number of candles fetched per timeframe.
const KLINE_LIMIT: u32 = 100;

/// Market data over a Binance-futures-shaped public REST API (no signature
/// required).
pub struct HttpMarketData {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMarketData {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET mark price for {symbol}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse mark-price response")?;

        if !status.is_success() {
            anyhow::bail!("mark-price API returned {}: {}", status, body);
        }

        parse_str_f64(&body["markPrice"])
    }

    async fn fetch_klines(&self, symbol: &str, interval: &str) -> Result<Vec<Kline>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, KLINE_LIMIT
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET klines {symbol}/{interval}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("klines API returned {}: {}", status, body);
        }

        parse_kline_rows(&body)
    }
}

#[async_trait]
impl MarketData for HttpMarketData {
    async fn snapshot(&self, symbol: &str, timeframes: &[String]) -> Result<MarketSnapshot> {
        let current_price = self.fetch_mark_price(symbol).await?;

        let mut klines = HashMap::with_capacity(timeframes.len());
        for timeframe in timeframes {
            let candles = self.fetch_klines(symbol, timeframe).await?;
            klines.insert(timeframe.clone(), candles);
        }

        debug!(symbol, current_price, timeframes = timeframes.len(), "market snapshot fetched");

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            current_price,
            klines,
        })
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Parse the array-of-arrays kline payload.
///
/// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume, [6] closeTime (further fields ignored).
fn parse_kline_rows(body: &serde_json::Value) -> Result<Vec<Kline>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 7 {
            continue;
        }
        candles.push(Kline {
            open_time: arr[0].as_i64().unwrap_or(0),
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
            close_time: arr[6].as_i64().unwrap_or(0),
        });
    }
    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_str_f64_accepts_both_shapes() {
        assert_eq!(parse_str_f64(&serde_json::json!("50000.5")).unwrap(), 50000.5);
        assert_eq!(parse_str_f64(&serde_json::json!(42.0)).unwrap(), 42.0);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
        assert!(parse_str_f64(&serde_json::json!("abc")).is_err());
    }

    #[test]
    fn kline_rows_parse_and_skip_short_entries() {
        let body = serde_json::json!([
            [1700000000000i64, "100", "110", "95", "105", "1234.5", 1700000899999i64, "x", 10, "1", "2"],
            [1700000900000i64, "105"]
        ]);
        let candles = parse_kline_rows(&body).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[0].close_time, 1700000899999);
    }

    #[test]
    fn kline_rows_reject_non_array() {
        assert!(parse_kline_rows(&serde_json::json!({"err": true})).is_err());
    }
}
