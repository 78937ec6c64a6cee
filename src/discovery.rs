use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::{CandidateMarket, Origin, SourceTag};
use crate::geocode::GeocodeService;

const MAX_PLACES_RADIUS_KM: f64 = 50.0;
const BASE_BACKOFF_MS: u64 = 250;
const DEFAULT_CATEGORY: &str = "market";

/// A venue returned by a place-search backend, before validation.
#[derive(Debug, Clone)]
pub struct PlaceHit {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search_markets(
        &self,
        origin: Origin,
        radius_m: u32,
        text_hint: Option<&str>,
        category: Option<&str>,
    ) -> AppResult<Vec<PlaceHit>>;
}

#[async_trait]
pub trait OpenGeoSearch: Send + Sync {
    async fn fetch_markets(
        &self,
        endpoint: &str,
        origin: Origin,
        radius_km: f64,
    ) -> AppResult<Vec<PlaceHit>>;
}

/// Places-style text search with a location-bias circle.
pub struct HttpPlacesClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
}

impl HttpPlacesClient {
    pub fn maybe_new(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(key) = config.places_api_key.clone() else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .user_agent(concat!("mandi-finder/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.places_timeout_secs))
            .build()?;
        Ok(Some(Self {
            http,
            base: config.places_api_base.trim_end_matches('/').to_string(),
            api_key: key.expose_secret().to_string(),
        }))
    }
}

#[async_trait]
impl PlaceSearch for HttpPlacesClient {
    async fn search_markets(
        &self,
        origin: Origin,
        radius_m: u32,
        text_hint: Option<&str>,
        category: Option<&str>,
    ) -> AppResult<Vec<PlaceHit>> {
        #[derive(serde::Serialize)]
        struct RequestBody<'a> {
            #[serde(rename = "textQuery")]
            text_query: &'a str,
            #[serde(rename = "includedType", skip_serializing_if = "Option::is_none")]
            included_type: Option<&'a str>,
            #[serde(rename = "maxResultCount")]
            max_result_count: u8,
            #[serde(rename = "locationBias")]
            location_bias: LocationBias,
        }

        #[derive(serde::Serialize)]
        struct LocationBias {
            circle: BiasCircle,
        }

        #[derive(serde::Serialize)]
        struct BiasCircle {
            center: BiasCenter,
            radius: u32,
        }

        #[derive(serde::Serialize)]
        struct BiasCenter {
            latitude: f64,
            longitude: f64,
        }

        #[derive(Deserialize)]
        struct Response {
            places: Option<Vec<ResponsePlace>>,
        }

        #[derive(Deserialize)]
        struct ResponsePlace {
            #[serde(rename = "displayName")]
            display_name: Option<ResponseText>,
            location: Option<ResponseLocation>,
        }

        #[derive(Deserialize)]
        struct ResponseText {
            text: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            latitude: Option<f64>,
            longitude: Option<f64>,
        }

        let body = RequestBody {
            text_query: text_hint.unwrap_or("marketplace"),
            included_type: category,
            max_result_count: 20,
            location_bias: LocationBias {
                circle: BiasCircle {
                    center: BiasCenter {
                        latitude: origin.latitude,
                        longitude: origin.longitude,
                    },
                    radius: radius_m,
                },
            },
        };

        let response = self
            .http
            .post(format!("{}/places:searchText", self.base))
            .header("X-Goog-Api-Key", &self.api_key)
            .header(
                "X-Goog-FieldMask",
                "places.displayName,places.location",
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Provider {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: Response = response.json().await?;
        Ok(parsed
            .places
            .unwrap_or_default()
            .into_iter()
            .filter_map(|place| {
                let name = place.display_name.and_then(|text| text.text)?;
                let location = place.location?;
                Some(PlaceHit {
                    name,
                    latitude: location.latitude?,
                    longitude: location.longitude?,
                })
            })
            .collect())
    }
}

/// Overpass-style open-geodata query for marketplace-tagged features.
pub struct HttpOpenGeoClient {
    http: reqwest::Client,
}

impl HttpOpenGeoClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mandi-finder/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.places_timeout_secs.max(15)))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl OpenGeoSearch for HttpOpenGeoClient {
    async fn fetch_markets(
        &self,
        endpoint: &str,
        origin: Origin,
        radius_km: f64,
    ) -> AppResult<Vec<PlaceHit>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            elements: Vec<Element>,
        }

        #[derive(Deserialize)]
        struct Element {
            id: Option<u64>,
            lat: Option<f64>,
            lon: Option<f64>,
            center: Option<Center>,
            #[serde(default)]
            tags: Option<Tags>,
        }

        #[derive(Deserialize)]
        struct Center {
            lat: f64,
            lon: f64,
        }

        #[derive(Deserialize)]
        struct Tags {
            name: Option<String>,
        }

        let radius_m = (radius_km * 1000.0) as u64;
        let query = format!(
            "[out:json][timeout:25];(\
             node[\"amenity\"=\"marketplace\"](around:{radius_m},{lat},{lon});\
             way[\"amenity\"=\"marketplace\"](around:{radius_m},{lat},{lon});\
             );out center;",
            lat = origin.latitude,
            lon = origin.longitude,
        );

        let response: Response = self
            .http
            .post(endpoint)
            .form(&[("data", query.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .elements
            .into_iter()
            .filter_map(|element| {
                let (latitude, longitude) = match (element.lat, element.lon, element.center) {
                    (Some(lat), Some(lon), _) => (lat, lon),
                    (_, _, Some(center)) => (center.lat, center.lon),
                    _ => return None,
                };
                let name = element
                    .tags
                    .and_then(|tags| tags.name)
                    .unwrap_or_else(|| format!("marketplace {}", element.id.unwrap_or_default()));
                Some(PlaceHit {
                    name,
                    latitude,
                    longitude,
                })
            })
            .collect())
    }
}

/// Three-tier candidate discovery: place search, open geodata, then the
/// local geocode cache. Always returns a (possibly empty) list, sorted by
/// distance.
pub struct DiscoveryService {
    places: Option<Arc<dyn PlaceSearch>>,
    open_geo: Arc<dyn OpenGeoSearch>,
    open_geo_endpoints: Vec<String>,
    geocode: Arc<GeocodeService>,
    jitter_rng: Mutex<StdRng>,
}

impl DiscoveryService {
    pub fn new(config: &AppConfig, geocode: Arc<GeocodeService>) -> AppResult<Self> {
        let places = HttpPlacesClient::maybe_new(config)?
            .map(|client| Arc::new(client) as Arc<dyn PlaceSearch>);
        let open_geo: Arc<dyn OpenGeoSearch> = Arc::new(HttpOpenGeoClient::new(config)?);
        Ok(Self::from_parts(
            places,
            open_geo,
            config.open_geo_endpoints.clone(),
            geocode,
            StdRng::from_entropy(),
        ))
    }

    pub fn from_parts(
        places: Option<Arc<dyn PlaceSearch>>,
        open_geo: Arc<dyn OpenGeoSearch>,
        open_geo_endpoints: Vec<String>,
        geocode: Arc<GeocodeService>,
        jitter_rng: StdRng,
    ) -> Self {
        Self {
            places,
            open_geo,
            open_geo_endpoints,
            geocode,
            jitter_rng: Mutex::new(jitter_rng),
        }
    }

    pub async fn discover_candidates(
        &self,
        origin: Origin,
        radius_km: f64,
        hint_terms: &[&str],
    ) -> Vec<CandidateMarket> {
        let mut candidates = self.places_tier(origin, radius_km, hint_terms).await;
        if candidates.is_empty() {
            candidates = self.open_geo_tier(origin, radius_km).await;
        }
        if candidates.is_empty() {
            debug!("both network tiers empty; deriving candidates from geocode cache");
            candidates = self.geocode.cached_places_within(origin, radius_km);
        }
        candidates.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        candidates
    }

    /// Primary tier. Each 400-class response relaxes the request one step:
    /// full hints, then no text hint, then no category filter either.
    async fn places_tier(
        &self,
        origin: Origin,
        radius_km: f64,
        hint_terms: &[&str],
    ) -> Vec<CandidateMarket> {
        let Some(places) = &self.places else {
            debug!("place search tier skipped; no API key configured");
            return Vec::new();
        };

        let text_hint = if hint_terms.is_empty() {
            "wholesale market mandi".to_string()
        } else {
            hint_terms.join(" ")
        };
        let radius_m = (radius_km.min(MAX_PLACES_RADIUS_KM) * 1000.0) as u32;
        let attempts: [(Option<&str>, Option<&str>); 3] = [
            (Some(text_hint.as_str()), Some(DEFAULT_CATEGORY)),
            (None, Some(DEFAULT_CATEGORY)),
            (None, None),
        ];

        for (attempt, (text, category)) in attempts.iter().enumerate() {
            match places.search_markets(origin, radius_m, *text, *category).await {
                Ok(hits) => {
                    return hits
                        .into_iter()
                        .map(|hit| {
                            CandidateMarket::new(
                                hit.name,
                                hit.latitude,
                                hit.longitude,
                                origin,
                                SourceTag::Places,
                            )
                        })
                        .filter(|candidate| candidate.distance_km <= radius_km)
                        .collect();
                }
                Err(AppError::Provider { status, message })
                    if (400..500).contains(&status) && attempt + 1 < attempts.len() =>
                {
                    warn!(status, attempt, %message, "place search rejected; relaxing request");
                }
                Err(err) => {
                    warn!(?err, "place search tier failed");
                    return Vec::new();
                }
            }
        }
        Vec::new()
    }

    /// Secondary tier: equivalent open-geodata endpoints tried in order,
    /// with exponential backoff between endpoints.
    async fn open_geo_tier(&self, origin: Origin, radius_km: f64) -> Vec<CandidateMarket> {
        for (attempt, endpoint) in self.open_geo_endpoints.iter().enumerate() {
            if attempt > 0 {
                sleep(self.backoff_delay(attempt as u32)).await;
            }
            match self.open_geo.fetch_markets(endpoint, origin, radius_km).await {
                Ok(hits) => {
                    let candidates: Vec<CandidateMarket> = hits
                        .into_iter()
                        .map(|hit| {
                            CandidateMarket::new(
                                hit.name,
                                hit.latitude,
                                hit.longitude,
                                origin,
                                SourceTag::OpenGeo,
                            )
                        })
                        .filter(|candidate| candidate.distance_km <= radius_km)
                        .collect();
                    if !candidates.is_empty() {
                        return candidates;
                    }
                }
                Err(err) => {
                    warn!(?err, endpoint, "open geodata endpoint failed");
                }
            }
        }
        Vec::new()
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            let jitter_ms = rng.gen_range(0..BASE_BACKOFF_MS);
            Duration::from_millis(jitter_ms)
        };
        base + jitter
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::tempdir;

    use super::*;
    use crate::geo::RegionInfo;
    use crate::geocode::Geocoder;

    struct IdleGeocoder;

    #[async_trait]
    impl Geocoder for IdleGeocoder {
        async fn geocode(&self, _query: &str) -> AppResult<Option<(f64, f64)>> {
            Ok(None)
        }

        async fn reverse(&self, _lat: f64, _lon: f64) -> AppResult<Option<RegionInfo>> {
            Ok(None)
        }
    }

    struct RejectingPlaces {
        reject_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PlaceSearch for RejectingPlaces {
        async fn search_markets(
            &self,
            origin: Origin,
            _radius_m: u32,
            _text_hint: Option<&str>,
            _category: Option<&str>,
        ) -> AppResult<Vec<PlaceHit>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.reject_first {
                return Err(AppError::Provider {
                    status: 400,
                    message: "unsupported parameter".into(),
                });
            }
            Ok(vec![PlaceHit {
                name: "KR Market".into(),
                latitude: origin.latitude + 0.05,
                longitude: origin.longitude,
            }])
        }
    }

    struct EmptyOpenGeo;

    #[async_trait]
    impl OpenGeoSearch for EmptyOpenGeo {
        async fn fetch_markets(
            &self,
            _endpoint: &str,
            _origin: Origin,
            _radius_km: f64,
        ) -> AppResult<Vec<PlaceHit>> {
            Ok(Vec::new())
        }
    }

    struct SecondEndpointOpenGeo;

    #[async_trait]
    impl OpenGeoSearch for SecondEndpointOpenGeo {
        async fn fetch_markets(
            &self,
            endpoint: &str,
            origin: Origin,
            _radius_km: f64,
        ) -> AppResult<Vec<PlaceHit>> {
            if endpoint.contains("primary") {
                return Err(AppError::Config("gateway timeout".into()));
            }
            Ok(vec![PlaceHit {
                name: "Yeshwanthpur Mandi".into(),
                latitude: origin.latitude - 0.03,
                longitude: origin.longitude + 0.02,
            }])
        }
    }

    fn geocode_service(dir: &std::path::Path) -> Arc<GeocodeService> {
        let mut config = AppConfig::from_env();
        config.geocode_min_interval_ms = 0;
        Arc::new(GeocodeService::from_parts(Arc::new(IdleGeocoder), &config, dir))
    }

    fn origin() -> Origin {
        Origin {
            latitude: 12.97,
            longitude: 77.59,
        }
    }

    #[tokio::test]
    async fn relaxes_request_on_client_errors() {
        let dir = tempdir().unwrap();
        let places = Arc::new(RejectingPlaces {
            reject_first: 2,
            calls: AtomicUsize::new(0),
        });
        let service = DiscoveryService::from_parts(
            Some(places.clone()),
            Arc::new(EmptyOpenGeo),
            vec!["https://geo.example/api".into()],
            geocode_service(dir.path()),
            StdRng::seed_from_u64(7),
        );

        let candidates = service.discover_candidates(origin(), 50.0, &["mandi"]).await;
        assert_eq!(places.calls.load(Ordering::SeqCst), 3);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].source, SourceTag::Places);
        assert!(candidates[0].distance_km <= 50.0);
    }

    #[tokio::test]
    async fn falls_back_across_open_geo_endpoints() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::from_parts(
            None,
            Arc::new(SecondEndpointOpenGeo),
            vec![
                "https://primary.example/api".into(),
                "https://secondary.example/api".into(),
            ],
            geocode_service(dir.path()),
            StdRng::seed_from_u64(7),
        );

        let candidates = service.discover_candidates(origin(), 50.0, &[]).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].raw_name, "Yeshwanthpur Mandi");
        assert_eq!(candidates[0].source, SourceTag::OpenGeo);
    }

    #[tokio::test]
    async fn last_resort_uses_geocode_cache() {
        let dir = tempdir().unwrap();
        let geocode = {
            let mut config = AppConfig::from_env();
            config.geocode_min_interval_ms = 0;
            struct NearbyGeocoder;
            #[async_trait]
            impl Geocoder for NearbyGeocoder {
                async fn geocode(&self, _query: &str) -> AppResult<Option<(f64, f64)>> {
                    Ok(Some((12.98, 77.60)))
                }
                async fn reverse(&self, _lat: f64, _lon: f64) -> AppResult<Option<RegionInfo>> {
                    Ok(None)
                }
            }
            let service = GeocodeService::from_parts(Arc::new(NearbyGeocoder), &config, dir.path());
            service.resolve_coordinates("city market", None).await;
            Arc::new(service)
        };

        let service = DiscoveryService::from_parts(
            None,
            Arc::new(EmptyOpenGeo),
            vec!["https://geo.example/api".into()],
            geocode,
            StdRng::seed_from_u64(7),
        );

        let candidates = service.discover_candidates(origin(), 50.0, &[]).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].source, SourceTag::GeocodeCache);
    }

    #[tokio::test]
    async fn exhausted_tiers_return_empty() {
        let dir = tempdir().unwrap();
        let service = DiscoveryService::from_parts(
            None,
            Arc::new(EmptyOpenGeo),
            vec!["https://geo.example/api".into()],
            geocode_service(dir.path()),
            StdRng::seed_from_u64(7),
        );
        assert!(service.discover_candidates(origin(), 50.0, &[]).await.is_empty());
    }
}
