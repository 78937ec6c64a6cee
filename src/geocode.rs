use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geo::{haversine_km, normalize_name, CandidateMarket, Origin, RegionInfo, SourceTag};
use crate::store::{
    GeocodeCacheEntry, GeocodeCacheMap, JsonStore, RateLimiterStamp, GEOCODE_CACHE_FILE,
    RATE_LIMITER_FILE,
};

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> AppResult<Option<(f64, f64)>>;
    async fn reverse(&self, latitude: f64, longitude: f64) -> AppResult<Option<RegionInfo>>;
}

/// Nominatim-style forward/reverse geocoder. The service's usage policy
/// requires an identifying user agent and at most one request per second;
/// the spacing is enforced by `GeocodeService`, not here.
pub struct HttpGeocoder {
    http: reqwest::Client,
    base: String,
}

impl HttpGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mandi-finder/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.geocode_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base: config.geocode_api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

#[derive(Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<ReverseAddress>,
}

#[derive(Deserialize)]
struct ReverseAddress {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    state_district: Option<String>,
    #[serde(default)]
    county: Option<String>,
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, query: &str) -> AppResult<Option<(f64, f64)>> {
        let hits: Vec<SearchHit> = self
            .http
            .get(format!("{}/search", self.base))
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(hits.first().and_then(|hit| {
            let lat = hit.lat.parse::<f64>().ok()?;
            let lon = hit.lon.parse::<f64>().ok()?;
            Some((lat, lon))
        }))
    }

    async fn reverse(&self, latitude: f64, longitude: f64) -> AppResult<Option<RegionInfo>> {
        let response: ReverseResponse = self
            .http
            .get(format!("{}/reverse", self.base))
            .query(&[
                ("lat", latitude.to_string().as_str()),
                ("lon", longitude.to_string().as_str()),
                ("format", "json"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.address.map(|address| RegionInfo {
            state: address.state,
            district: address.state_district.or(address.county),
        }))
    }
}

/// Geocode lookups backed by a persistent cache and a persisted 1 Hz rate
/// limiter. A failed or empty lookup is a normal `None`, never an error.
pub struct GeocodeService {
    geocoder: Arc<dyn Geocoder>,
    cache: JsonStore<GeocodeCacheMap>,
    stamp: JsonStore<RateLimiterStamp>,
    gate: AsyncMutex<()>,
    min_interval: Duration,
    region_memo: Mutex<HashMap<String, Option<RegionInfo>>>,
}

impl GeocodeService {
    pub fn new(config: &AppConfig, data_dir: &Path) -> AppResult<Self> {
        let geocoder: Arc<dyn Geocoder> = Arc::new(HttpGeocoder::new(config)?);
        Ok(Self::from_parts(geocoder, config, data_dir))
    }

    pub fn from_parts(geocoder: Arc<dyn Geocoder>, config: &AppConfig, data_dir: &Path) -> Self {
        Self {
            geocoder,
            cache: JsonStore::load(data_dir.join(GEOCODE_CACHE_FILE)),
            stamp: JsonStore::load(data_dir.join(RATE_LIMITER_FILE)),
            gate: AsyncMutex::new(()),
            min_interval: Duration::from_millis(config.geocode_min_interval_ms),
            region_memo: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a place name to coordinates, consulting the cache first.
    pub async fn resolve_coordinates(
        &self,
        query: &str,
        region_hint: Option<&str>,
    ) -> Option<(f64, f64)> {
        let key = cache_key(query, region_hint);
        if let Some(entry) = self.cache.read(|map| map.get(&key).cloned()) {
            debug!(%key, "geocode cache hit");
            return Some((entry.latitude, entry.longitude));
        }

        match self.throttled(|| self.geocoder.geocode(&key)).await {
            Ok(Some((latitude, longitude))) => {
                self.cache.write(|map| {
                    map.insert(
                        key.clone(),
                        GeocodeCacheEntry {
                            latitude,
                            longitude,
                            captured_at: Utc::now(),
                        },
                    );
                });
                Some((latitude, longitude))
            }
            Ok(None) => None,
            Err(err) => {
                warn!(?err, "geocoding call failed");
                None
            }
        }
    }

    /// Reverse-geocodes the origin to its administrative region. Definitive
    /// answers (found or genuinely absent) are memoized per service
    /// instance; a failed call is not, so the next lookup retries.
    pub async fn resolve_region(&self, origin: Origin) -> Option<RegionInfo> {
        let memo_key = format!("{:.3},{:.3}", origin.latitude, origin.longitude);
        if let Some(cached) = self.region_memo.lock().get(&memo_key).cloned() {
            return cached;
        }

        match self
            .throttled(|| self.geocoder.reverse(origin.latitude, origin.longitude))
            .await
        {
            Ok(region) => {
                self.region_memo.lock().insert(memo_key, region.clone());
                region
            }
            Err(err) => {
                warn!(?err, "reverse geocoding failed");
                None
            }
        }
    }

    /// Derives candidates from previously cached geocode entries within
    /// `radius_km`. Network-free; the discovery tier of last resort.
    pub fn cached_places_within(&self, origin: Origin, radius_km: f64) -> Vec<CandidateMarket> {
        self.cache.read(|map| {
            let mut candidates: Vec<CandidateMarket> = map
                .iter()
                .filter(|(_, entry)| {
                    haversine_km(origin.latitude, origin.longitude, entry.latitude, entry.longitude)
                        <= radius_km
                })
                .map(|(name, entry)| {
                    CandidateMarket::new(
                        name.clone(),
                        entry.latitude,
                        entry.longitude,
                        origin,
                        SourceTag::GeocodeCache,
                    )
                })
                .collect();
            candidates.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
            candidates
        })
    }

    /// Serializes outbound geocoding through the minimum-spacing window.
    /// The stamp is advanced before the call so concurrent waiters queue
    /// behind the full interval, and persisted so spacing survives
    /// restarts. Callers decide how to treat errors; an empty result is a
    /// definitive `Ok(None)`.
    async fn throttled<T, F, Fut>(&self, call: F) -> AppResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = AppResult<Option<T>>>,
    {
        let _serialized = self.gate.lock().await;
        let last_call = self.stamp.read(|stamp| stamp.last_call);
        if let Some(last) = last_call {
            let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        self.stamp.write(|stamp| stamp.last_call = Some(Utc::now()));
        call().await
    }
}

fn cache_key(query: &str, region_hint: Option<&str>) -> String {
    match region_hint {
        Some(hint) => normalize_name(&format!("{query}, {hint}")),
        None => normalize_name(query),
    }
}
