pub mod config;
pub mod discovery;
pub mod errors;
pub mod forecast;
pub mod geo;
pub mod geocode;
pub mod lookup;
pub mod ranking;
pub mod registry;
pub mod resolve;
pub mod store;
pub mod validate;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub use config::{AppConfig, PublicAppConfig};
pub use errors::{AppError, AppResult};
pub use forecast::{forecast_prices, ForecastPoint, DEFAULT_HORIZON_DAYS};
pub use geo::{CandidateMarket, Origin, RegionInfo, SourceTag};
pub use ranking::EffectivePriceResult;
pub use registry::{PriceQuery, PriceRecord};

use discovery::DiscoveryService;
use geocode::GeocodeService;
use lookup::{PriceCache, PriceLookup};
use ranking::rank;
use registry::{synthetic_record, RegistryService};
use resolve::resolve_batch;
use validate::{validate_and_cap, NameHeuristicValidator};

static TRACING: OnceCell<()> = OnceCell::new();

/// Installs the global tracing subscriber once, honouring `RUST_LOG` and
/// defaulting to info for this crate.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mandi_finder=info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

/// Free-text terms appended to the farmer's commodity when querying the
/// primary place search.
const PLACES_HINT_TERMS: &[&str] = &["mandi", "wholesale market"];

/// End-to-end engine: discovers nearby commodity markets, resolves each
/// one's delivery-adjusted price, and ranks the results for the farmer.
pub struct MarketFinder {
    config: AppConfig,
    discovery: DiscoveryService,
    registry: Arc<RegistryService>,
    lookup: Arc<PriceLookup>,
}

impl MarketFinder {
    pub fn new(config: AppConfig, data_dir: &Path) -> AppResult<Self> {
        let geocode = Arc::new(GeocodeService::new(&config, data_dir)?);
        let discovery = DiscoveryService::new(&config, geocode.clone())?;
        let registry = Arc::new(RegistryService::new(&config)?);
        let cache = Arc::new(PriceCache::load(data_dir));
        let lookup = Arc::new(PriceLookup::new(registry.clone(), geocode, cache));
        Ok(Self {
            config,
            discovery,
            registry,
            lookup,
        })
    }

    pub fn public_config(&self) -> PublicAppConfig {
        self.config.public_profile()
    }

    /// Finds markets within `radius_km` of the origin, resolves a price for
    /// each, and returns the top `top_n` ranked by distance and effective
    /// price. Markets with no resolvable price get a deterministic
    /// synthetic quote, flagged as such.
    pub async fn find_nearest_markets(
        &self,
        commodity: &str,
        origin: Origin,
        radius_km: f64,
        top_n: usize,
        fuel_rate_per_ton_km: f64,
        mandi_fees_per_ton: f64,
    ) -> AppResult<Vec<EffectivePriceResult>> {
        let discovered = self
            .discovery
            .discover_candidates(origin, radius_km, PLACES_HINT_TERMS)
            .await;
        let candidates = validate_and_cap(
            &NameHeuristicValidator,
            discovered,
            self.config.max_candidates,
        );
        if candidates.is_empty() {
            info!(commodity, "no market candidates in range");
            return Ok(Vec::new());
        }
        info!(
            commodity,
            count = candidates.len(),
            "resolving prices for candidate markets"
        );

        let mut records = resolve_batch(
            self.lookup.clone(),
            commodity,
            &candidates,
            origin,
            self.config.max_price_workers,
            Duration::from_secs(self.config.batch_timeout_secs),
        )
        .await;
        for (slot, candidate) in records.iter_mut().zip(candidates.iter()) {
            if slot.is_none() {
                *slot = Some(synthetic_record(&candidate.raw_name, commodity));
            }
        }

        Ok(rank(
            &candidates,
            &records,
            top_n,
            fuel_rate_per_ton_km,
            mandi_fees_per_ton,
        ))
    }

    /// Raw price rows for a query, falling back through the secondary
    /// registry and finally a synthetic series.
    pub async fn fetch_prices(&self, query: &PriceQuery) -> Vec<PriceRecord> {
        self.registry.fetch_prices(query).await
    }

    /// Price projection for the coming fortnight from an observed series.
    pub fn forecast_prices(&self, series: &[PriceRecord]) -> Vec<ForecastPoint> {
        forecast_prices(series, DEFAULT_HORIZON_DAYS)
    }
}
