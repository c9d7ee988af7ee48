//! Market discovery.
//!
//! [`GammaDiscovery`] looks a window's market up by slug on the Gamma API and
//! maps its outcome labels to token ids. [`SlugTokenDiscovery`] derives token
//! ids from the slug itself and is used for replays.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use updown_core::{DiscoveryConfig, DiscoveryError, MarketDiscovery, MarketTokens};

/// Market metadata as returned by `/markets`. List fields are JSON-encoded strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    slug: String,
    #[serde(default)]
    outcomes: Option<String>,
    #[serde(default)]
    clob_token_ids: Option<String>,
    #[serde(default)]
    accepting_orders: Option<bool>,
}

fn parse_list(field: &str, raw: Option<&str>) -> Result<Vec<String>, DiscoveryError> {
    let raw = raw.ok_or_else(|| DiscoveryError::Malformed(format!("missing {field}")))?;
    serde_json::from_str(raw).map_err(|e| DiscoveryError::Malformed(format!("{field}: {e}")))
}

/// Gamma API market lookup.
#[derive(Debug, Clone)]
pub struct GammaDiscovery {
    http: Client,
    base_url: String,
}

impl GammaDiscovery {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DiscoveryError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.gamma_url.trim_end_matches('/').to_string(),
        })
    }

    /// Sets a custom base URL (useful for testing).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MarketDiscovery for GammaDiscovery {
    async fn resolve(&self, market_id: &str) -> Result<MarketTokens, DiscoveryError> {
        let url = format!("{}/markets", self.base_url);
        debug!(url = %url, slug = market_id, "Resolving market");

        let response = self
            .http
            .get(&url)
            .query(&[("slug", market_id)])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| DiscoveryError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Http(format!("Gamma API error {status}: {text}")));
        }

        let markets: Vec<GammaMarket> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
        let market = markets
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::NotFound(market_id.to_string()))?;

        if market.accepting_orders == Some(false) {
            return Err(DiscoveryError::NotAccepting(market.slug));
        }

        let outcomes = parse_list("outcomes", market.outcomes.as_deref())?;
        let tokens = parse_list("clobTokenIds", market.clob_token_ids.as_deref())?;
        Ok(MarketTokens::from_outcomes(market.slug, &outcomes, &tokens)?)
    }
}

/// Offline discovery: tokens are `{slug}:up` and `{slug}:down`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlugTokenDiscovery;

impl SlugTokenDiscovery {
    #[must_use]
    pub fn tokens(market_id: &str) -> MarketTokens {
        MarketTokens {
            market_id: market_id.to_string(),
            up_token: format!("{market_id}:up"),
            down_token: format!("{market_id}:down"),
        }
    }
}

#[async_trait]
impl MarketDiscovery for SlugTokenDiscovery {
    async fn resolve(&self, market_id: &str) -> Result<MarketTokens, DiscoveryError> {
        Ok(Self::tokens(market_id))
    }
}
