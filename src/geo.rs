use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Caller-supplied request origin. Immutable for the duration of a resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Origin {
    pub latitude: f64,
    pub longitude: f64,
}

/// Administrative region resolved by reverse geocoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionInfo {
    pub state: Option<String>,
    pub district: Option<String>,
}

/// Which discovery tier produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Places,
    OpenGeo,
    GeocodeCache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateMarket {
    pub raw_name: String,
    pub normalized_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
    pub source: SourceTag,
}

impl CandidateMarket {
    pub fn new(raw_name: String, latitude: f64, longitude: f64, origin: Origin, source: SourceTag) -> Self {
        let normalized_name = normalize_name(&raw_name);
        let distance_km = haversine_km(origin.latitude, origin.longitude, latitude, longitude);
        Self {
            raw_name,
            normalized_name,
            latitude,
            longitude,
            distance_km,
            source,
        }
    }
}

/// Lower-cased, whitespace-collapsed form used for dedup and cache keys.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Great-circle distance between two coordinates, in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}
