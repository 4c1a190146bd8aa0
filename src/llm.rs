// =============================================================================
// Decision Client — language-model capability behind an OpenAI-compatible API
// =============================================================================
//
// The engine asks the model once per cycle what to do, handing it the full
// trading context. Providers (DeepSeek, Qwen, self-hosted endpoints) all
// speak the /chat/completions wire shape, so a single HTTP client covers
// them; the provider is selected at construction by base URL + key + model.
//
// SECURITY: the API key is sent as a bearer header and never logged or
// serialized.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::autotrader::context::TradingContext;
use crate::types::Decision;

/// HTTP timeout for model calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Everything the model returned for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub decisions: Vec<Decision>,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Reasoning trace when the provider exposes one.
    #[serde(default)]
    pub thinking: String,
    pub elapsed_ms: u64,
}

/// The decision-acquisition capability.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    /// Ask the model for this cycle's decisions.
    ///
    /// `custom_prompt` is appended to (or, with `override_base`, replaces)
    /// the template's system prompt.
    async fn decide(
        &self,
        context: &TradingContext,
        template: &str,
        custom_prompt: Option<&str>,
        override_base: bool,
    ) -> Result<DecisionResponse>;
}

// ---------------------------------------------------------------------------
// Prompt templates
// ---------------------------------------------------------------------------

/// System prompt for `template`. Unknown names fall back to the default.
fn system_prompt_for(template: &str) -> &'static str {
    match template {
        "aggressive" => AGGRESSIVE_PROMPT,
        _ => DEFAULT_PROMPT,
    }
}

const DEFAULT_PROMPT: &str = "\
You are a disciplined perpetual-futures trader managing one account. \
Study the account state, open positions, candidate symbols, and open orders, \
then respond with a JSON array of decision objects. Each object has: \
\"action\" (open_long | open_short | close_long | close_short | partial_close \
| update_stop_loss | update_take_profit | hold | wait), \"symbol\", and, \
where the action needs them, \"position_size_usd\", \"leverage\", \
\"stop_loss\", \"take_profit\", \"close_percentage\", \"new_stop_loss\", \
\"new_take_profit\", and a short \"reasoning\". Every opening must carry a \
stop-loss and a take-profit on the correct side of the current price. \
Do not re-open a direction you already hold. Respond with the JSON array \
only.";

const AGGRESSIVE_PROMPT: &str = "\
You are an aggressive but risk-aware perpetual-futures trader. Favour \
momentum entries and cut losers fast. Respond with a JSON array of decision \
objects exactly as specified: \"action\", \"symbol\", and the fields the \
action needs (position_size_usd, leverage, stop_loss, take_profit, \
close_percentage, new_stop_loss, new_take_profit, reasoning). Every opening \
must carry protective prices on the correct side of the market. Respond \
with the JSON array only.";

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP client
// ---------------------------------------------------------------------------

/// Decision client speaking the `/chat/completions` protocol.
pub struct HttpDecisionClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

impl HttpDecisionClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }
}

#[async_trait]
impl DecisionClient for HttpDecisionClient {
    async fn decide(
        &self,
        context: &TradingContext,
        template: &str,
        custom_prompt: Option<&str>,
        override_base: bool,
    ) -> Result<DecisionResponse> {
        let system_prompt = match (custom_prompt, override_base) {
            (Some(custom), true) => custom.to_string(),
            (Some(custom), false) => format!("{}\n\n{custom}", system_prompt_for(template)),
            (None, _) => system_prompt_for(template).to_string(),
        };

        let user_prompt = serde_json::to_string_pretty(context)
            .context("failed to serialise trading context")?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let started = Instant::now();

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("model request failed")?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse model response")?;

        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            anyhow::bail!("model endpoint returned {}: {}", status, payload);
        }

        let message = &payload["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or_default();
        // DeepSeek-style reasoning models expose the trace separately.
        let thinking = message["reasoning_content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let decisions = parse_decisions(content)
            .with_context(|| format!("model returned undecodable decisions: {content}"))?;

        debug!(
            model = %self.model,
            decisions = decisions.len(),
            elapsed_ms,
            "model decisions received"
        );

        Ok(DecisionResponse {
            decisions,
            system_prompt,
            user_prompt,
            thinking,
            elapsed_ms,
        })
    }
}

impl std::fmt::Debug for HttpDecisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDecisionClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Decision extraction
// ---------------------------------------------------------------------------

/// Extract a decision list from model output.
///
/// Tolerates markdown code fences and an enclosing `{"decisions": [...]}`
/// object; otherwise falls back to the outermost `[...]` span.
pub fn parse_decisions(content: &str) -> Result<Vec<Decision>> {
    let trimmed = strip_fences(content);

    if let Ok(list) = serde_json::from_str::<Vec<Decision>>(trimmed) {
        return Ok(list);
    }

    #[derive(Deserialize)]
    struct Wrapped {
        decisions: Vec<Decision>,
    }
    if let Ok(wrapped) = serde_json::from_str::<Wrapped>(trimmed) {
        return Ok(wrapped.decisions);
    }

    // Last resort: the outermost array embedded in prose.
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            if let Ok(list) = serde_json::from_str::<Vec<Decision>>(&trimmed[start..=end]) {
                warn!("model wrapped its decision array in prose");
                return Ok(list);
            }
        }
    }

    anyhow::bail!("no decision array found in model output")
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}
