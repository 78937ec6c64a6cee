use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppResult;

const SYNTHETIC_SERIES_DAYS: usize = 7;

/// A single market price observation, normalized to one shape regardless of
/// which provider produced it. Prices are per quintal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub market_label: String,
    pub commodity: String,
    pub min_price: f64,
    pub max_price: f64,
    pub modal_price: f64,
    #[serde(default)]
    pub trade_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub synthetic: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PriceQuery {
    pub commodity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

impl PriceQuery {
    pub fn commodity(commodity: &str) -> Self {
        Self {
            commodity: commodity.to_string(),
            ..Self::default()
        }
    }

    pub fn with_market(mut self, market: &str) -> Self {
        self.market = Some(market.to_string());
        self
    }

    pub fn with_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }
}

#[async_trait]
pub trait PriceRegistry: Send + Sync {
    async fn query(&self, query: &PriceQuery) -> AppResult<Vec<PriceRecord>>;
}

/// Raw provider row. Registries disagree on key spelling (the government
/// feed famously writes "Min Prize"), so aliases cover every variant seen
/// in the wild and prices tolerate string-encoded numbers.
#[derive(Debug, Deserialize)]
pub struct ProviderRow {
    #[serde(
        default,
        alias = "Market",
        alias = "market",
        alias = "City",
        alias = "city"
    )]
    pub market: String,
    #[serde(default, alias = "Commodity", alias = "commodity")]
    pub commodity: String,
    #[serde(
        default,
        alias = "Min Prize",
        alias = "MinPrice",
        alias = "min_price",
        deserialize_with = "flexible_f64"
    )]
    pub min_price: f64,
    #[serde(
        default,
        alias = "Max Prize",
        alias = "MaxPrice",
        alias = "max_price",
        deserialize_with = "flexible_f64"
    )]
    pub max_price: f64,
    #[serde(
        default,
        alias = "Modal Price",
        alias = "Modal_Price",
        alias = "modal_price",
        deserialize_with = "flexible_f64"
    )]
    pub modal_price: f64,
    #[serde(default, alias = "Date", alias = "Arrival_Date", alias = "date")]
    pub date: Option<String>,
    #[serde(default, alias = "State", alias = "state")]
    pub state: Option<String>,
}

impl ProviderRow {
    pub fn into_record(self) -> PriceRecord {
        PriceRecord {
            market_label: self.market,
            commodity: self.commodity,
            min_price: self.min_price,
            max_price: self.max_price,
            modal_price: self.modal_price,
            trade_date: self.date.as_deref().and_then(parse_trade_date),
            state: self.state,
            latitude: None,
            longitude: None,
            synthetic: false,
        }
    }
}

fn parse_trade_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%d/%m/%Y"))
        .ok()
}

fn flexible_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
        Missing(Option<()>),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(value) => value,
        Raw::Text(text) => text.trim().parse().unwrap_or(0.0),
        Raw::Missing(_) => 0.0,
    })
}

/// Primary registry: CEDA-style JSON POST with bearer/api-key headers.
pub struct HttpRegistryClient {
    http: reqwest::Client,
    base: String,
    api_key: Option<SecretString>,
}

impl HttpRegistryClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mandi-finder/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.registry_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base: config.registry_api_base.trim_end_matches('/').to_string(),
            api_key: config.registry_api_key.clone(),
        })
    }
}

#[async_trait]
impl PriceRegistry for HttpRegistryClient {
    async fn query(&self, query: &PriceQuery) -> AppResult<Vec<PriceRecord>> {
        let mut request = self
            .http
            .post(format!("{}/agmarknet/prices", self.base))
            .json(query);
        if let Some(key) = &self.api_key {
            // The registry accepts the key as bearer or header; send both.
            request = request
                .bearer_auth(key.expose_secret())
                .header("x-api-key", key.expose_secret());
        }
        let rows: Vec<ProviderRow> = request.send().await?.error_for_status()?.json().await?;
        Ok(rows.into_iter().map(ProviderRow::into_record).collect())
    }
}

/// Secondary registry: data.gov.in-style GET with filter query parameters.
pub struct SecondaryRegistryClient {
    http: reqwest::Client,
    base: String,
    api_key: Option<SecretString>,
}

impl SecondaryRegistryClient {
    pub fn maybe_new(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(base) = config.secondary_registry_base.clone() else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .user_agent(concat!("mandi-finder/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.registry_timeout_secs))
            .build()?;
        Ok(Some(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            api_key: config.secondary_registry_api_key.clone(),
        }))
    }
}

#[async_trait]
impl PriceRegistry for SecondaryRegistryClient {
    async fn query(&self, query: &PriceQuery) -> AppResult<Vec<PriceRecord>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            records: Vec<ProviderRow>,
        }

        let mut request = self.http.get(&self.base).query(&[
            ("format", "json"),
            ("limit", "200"),
            ("filters[commodity]", query.commodity.as_str()),
        ]);
        if let Some(market) = &query.market {
            request = request.query(&[("filters[market]", market.as_str())]);
        }
        if let Some(state) = &query.state {
            request = request.query(&[("filters[state]", state.as_str())]);
        }
        if let Some(key) = &self.api_key {
            request = request.query(&[("api-key", key.expose_secret())]);
        }

        let response: Response = request.send().await?.error_for_status()?.json().await?;
        Ok(response
            .records
            .into_iter()
            .map(ProviderRow::into_record)
            .collect())
    }
}

/// Deterministic seed for synthetic price generation. The same
/// (market, commodity) pair always synthesizes the same prices.
fn synthetic_seed(market: &str, commodity: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(market.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(commodity.to_lowercase().as_bytes());
    hasher.finalize().into()
}

/// Single plausible placeholder record for a market with no resolvable
/// price. Clearly flagged; never cached.
pub fn synthetic_record(market_label: &str, commodity: &str) -> PriceRecord {
    let mut rng = StdRng::from_seed(synthetic_seed(market_label, commodity));
    let modal = rng.gen_range(1200.0..3600.0_f64).round();
    let spread = rng.gen_range(50.0..250.0_f64).round();
    PriceRecord {
        market_label: market_label.to_string(),
        commodity: commodity.to_string(),
        min_price: modal - spread,
        max_price: modal + spread,
        modal_price: modal,
        trade_date: Some(Utc::now().date_naive()),
        state: None,
        latitude: None,
        longitude: None,
        synthetic: true,
    }
}

/// Short synthetic history ending today, used when every registry tier is
/// down so price queries never return empty-for-no-reason.
pub fn synthetic_samples(market_label: &str, commodity: &str) -> Vec<PriceRecord> {
    let mut rng = StdRng::from_seed(synthetic_seed(market_label, commodity));
    let base = rng.gen_range(1200.0..3600.0_f64).round();
    let today = Utc::now().date_naive();
    let mut modal = base;
    let mut out = Vec::with_capacity(SYNTHETIC_SERIES_DAYS);
    for offset in (0..SYNTHETIC_SERIES_DAYS as i64).rev() {
        modal = (modal + rng.gen_range(-60.0..60.0_f64)).max(100.0).round();
        let spread = rng.gen_range(50.0..250.0_f64).round();
        out.push(PriceRecord {
            market_label: market_label.to_string(),
            commodity: commodity.to_string(),
            min_price: modal - spread,
            max_price: modal + spread,
            modal_price: modal,
            trade_date: today.checked_sub_days(chrono::Days::new(offset as u64)),
            state: None,
            latitude: None,
            longitude: None,
            synthetic: true,
        });
    }
    out
}

/// Registry fallback chain: primary, then secondary, then synthetic.
///
/// Provider failures and empty result sets both fall through; the caller
/// never sees an error for a single registry being down.
pub struct RegistryService {
    primary: Arc<dyn PriceRegistry>,
    secondary: Option<Arc<dyn PriceRegistry>>,
}

impl RegistryService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let primary: Arc<dyn PriceRegistry> = Arc::new(HttpRegistryClient::new(config)?);
        let secondary = SecondaryRegistryClient::maybe_new(config)?
            .map(|client| Arc::new(client) as Arc<dyn PriceRegistry>);
        Ok(Self { primary, secondary })
    }

    pub fn from_parts(
        primary: Arc<dyn PriceRegistry>,
        secondary: Option<Arc<dyn PriceRegistry>>,
    ) -> Self {
        Self { primary, secondary }
    }

    /// Queries the real registries only. Errors degrade to an empty set.
    pub async fn query_registries(&self, query: &PriceQuery) -> Vec<PriceRecord> {
        match self.primary.query(query).await {
            Ok(rows) if !rows.is_empty() => return rows,
            Ok(_) => {}
            Err(err) => warn!(?err, "primary registry query failed"),
        }
        if let Some(secondary) = &self.secondary {
            match secondary.query(query).await {
                Ok(rows) if !rows.is_empty() => return rows,
                Ok(_) => {}
                Err(err) => warn!(?err, "secondary registry query failed"),
            }
        }
        Vec::new()
    }

    /// Full price fetch: registries first, deterministic synthetic sample
    /// set when everything is exhausted.
    pub async fn fetch_prices(&self, query: &PriceQuery) -> Vec<PriceRecord> {
        let rows = self.query_registries(query).await;
        if !rows.is_empty() {
            return rows;
        }
        let market = query.market.as_deref().unwrap_or("regional average");
        warn!(
            commodity = %query.commodity,
            market,
            "all registries exhausted; serving synthetic samples"
        );
        synthetic_samples(market, &query.commodity)
    }
}
