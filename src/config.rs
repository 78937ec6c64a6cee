use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_PLACES_API_BASE: &str = "https://places.googleapis.com/v1";
const DEFAULT_GEOCODE_API_BASE: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_REGISTRY_API_BASE: &str = "https://api.ceda.ashoka.edu.in/v1";
const DEFAULT_OPEN_GEO_ENDPOINTS: &str =
    "https://overpass-api.de/api/interpreter,https://overpass.kumi.systems/api/interpreter";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub places_api_base: String,
    pub places_api_key: Option<SecretString>,
    pub open_geo_endpoints: Vec<String>,
    pub geocode_api_base: String,
    pub registry_api_base: String,
    pub registry_api_key: Option<SecretString>,
    pub secondary_registry_base: Option<String>,
    pub secondary_registry_api_key: Option<SecretString>,
    pub geocode_min_interval_ms: u64,
    pub geocode_timeout_secs: u64,
    pub places_timeout_secs: u64,
    pub registry_timeout_secs: u64,
    pub batch_timeout_secs: u64,
    pub max_candidates: usize,
    pub max_price_workers: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub places_api_base: String,
    pub open_geo_endpoints: Vec<String>,
    pub geocode_api_base: String,
    pub registry_api_base: String,
    pub secondary_registry_base: Option<String>,
    pub geocode_min_interval_ms: u64,
    pub batch_timeout_secs: u64,
    pub max_candidates: usize,
    pub max_price_workers: usize,
    pub has_places_key: bool,
    pub has_registry_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            places_api_base: parse_string("PLACES_API_BASE", DEFAULT_PLACES_API_BASE),
            places_api_key: parse_secret("PLACES_API_KEY"),
            open_geo_endpoints: parse_endpoint_list("OPEN_GEO_ENDPOINTS", DEFAULT_OPEN_GEO_ENDPOINTS),
            geocode_api_base: parse_string("GEOCODE_API_BASE", DEFAULT_GEOCODE_API_BASE),
            registry_api_base: parse_string("REGISTRY_API_BASE", DEFAULT_REGISTRY_API_BASE),
            registry_api_key: parse_secret("REGISTRY_API_KEY"),
            secondary_registry_base: env::var("SECONDARY_REGISTRY_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            secondary_registry_api_key: parse_secret("SECONDARY_REGISTRY_API_KEY"),
            geocode_min_interval_ms: parse_u64("GEOCODE_MIN_INTERVAL_MS", 1_000),
            geocode_timeout_secs: parse_u64("GEOCODE_TIMEOUT_SECS", 10),
            places_timeout_secs: parse_u64("PLACES_TIMEOUT_SECS", 8),
            registry_timeout_secs: parse_u64("REGISTRY_TIMEOUT_SECS", 20),
            batch_timeout_secs: parse_u64("BATCH_TIMEOUT_SECS", 30),
            max_candidates: parse_usize("MAX_CANDIDATES", 6).max(1),
            max_price_workers: parse_usize("MAX_PRICE_WORKERS", 6).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            places_api_base: self.places_api_base.clone(),
            open_geo_endpoints: self.open_geo_endpoints.clone(),
            geocode_api_base: self.geocode_api_base.clone(),
            registry_api_base: self.registry_api_base.clone(),
            secondary_registry_base: self.secondary_registry_base.clone(),
            geocode_min_interval_ms: self.geocode_min_interval_ms,
            batch_timeout_secs: self.batch_timeout_secs,
            max_candidates: self.max_candidates,
            max_price_workers: self.max_price_workers,
            has_places_key: self.places_api_key.is_some(),
            has_registry_key: self.registry_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_endpoint_list(key: &str, default: &str) -> Vec<String> {
    let raw = parse_string(key, default);
    raw.split(',')
        .map(|entry| entry.trim().trim_end_matches('/').to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
