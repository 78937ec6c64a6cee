use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::registry::PriceRecord;

pub const GEOCODE_CACHE_FILE: &str = "geocode-cache.json";
pub const PRICE_CACHE_FILE: &str = "price-cache.json";
pub const RATE_LIMITER_FILE: &str = "rate-limiter.json";

const PRICE_CACHE_VERSION: u32 = 2;

/// Whole-file JSON store with a tolerant load and an atomic save.
///
/// A missing or unparseable file loads as `T::default()`; saves go through a
/// sibling temp file and a rename so readers never observe a partial write.
/// Persistence failures are logged and swallowed; callers treat the
/// in-memory value as authoritative for the rest of the process lifetime.
pub struct JsonStore<T> {
    path: PathBuf,
    value: Mutex<T>,
}

impl<T: Serialize + DeserializeOwned + Default> JsonStore<T> {
    pub fn load(path: PathBuf) -> Self {
        let value = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<T>(&contents) {
                Ok(value) => value,
                Err(err) => {
                    warn!(path = %path.display(), ?err, "unparseable store file; starting empty");
                    T::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => T::default(),
            Err(err) => {
                warn!(path = %path.display(), ?err, "unreadable store file; starting empty");
                T::default()
            }
        };
        Self {
            path,
            value: Mutex::new(value),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.lock())
    }

    /// Mutates the value and persists the whole store. A failed save keeps
    /// the in-memory update and never fails the calling operation.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.value.lock();
        let result = f(&mut guard);
        if let Err(err) = self.persist(&guard) {
            warn!(path = %self.path.display(), ?err, "failed to persist store");
        }
        result
    }

    fn persist(&self, value: &T) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(value)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path).map_err(AppError::from)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeCacheEntry {
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
}

pub type GeocodeCacheMap = HashMap<String, GeocodeCacheEntry>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterStamp {
    pub last_call: Option<DateTime<Utc>>,
}

/// Persisted price cache, nested date -> commodity -> market.
///
/// The nesting is load-bearing: a flat date -> market map lets a wheat
/// price answer a rice query. Legacy flat files (produced before the
/// commodity dimension existed) are migrated at load time, each record
/// re-keyed under its own recorded commodity, and written back versioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "PriceCacheFile")]
pub struct PriceCacheDoc {
    pub version: u32,
    pub days: HashMap<String, HashMap<String, HashMap<String, PriceRecord>>>,
}

impl Default for PriceCacheDoc {
    fn default() -> Self {
        Self {
            version: PRICE_CACHE_VERSION,
            days: HashMap::new(),
        }
    }
}

impl PriceCacheDoc {
    pub fn get(&self, date: NaiveDate, commodity: &str, market: &str) -> Option<&PriceRecord> {
        self.days
            .get(&date.to_string())?
            .get(commodity)?
            .get(market)
    }

    pub fn put(&mut self, date: NaiveDate, commodity: &str, market: &str, record: PriceRecord) {
        self.days
            .entry(date.to_string())
            .or_default()
            .entry(commodity.to_string())
            .or_default()
            .insert(market.to_string(), record);
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriceCacheFile {
    Versioned {
        version: u32,
        days: HashMap<String, HashMap<String, HashMap<String, PriceRecord>>>,
    },
    LegacyFlat(HashMap<String, HashMap<String, PriceRecord>>),
}

impl From<PriceCacheFile> for PriceCacheDoc {
    fn from(file: PriceCacheFile) -> Self {
        match file {
            PriceCacheFile::Versioned { version: _, days } => Self {
                version: PRICE_CACHE_VERSION,
                days,
            },
            PriceCacheFile::LegacyFlat(flat) => {
                let mut days: HashMap<String, HashMap<String, HashMap<String, PriceRecord>>> =
                    HashMap::new();
                for (date, markets) in flat {
                    let commodities = days.entry(date).or_default();
                    for (market, record) in markets {
                        let commodity = crate::geo::normalize_name(&record.commodity);
                        commodities
                            .entry(commodity)
                            .or_default()
                            .insert(market, record);
                    }
                }
                Self {
                    version: PRICE_CACHE_VERSION,
                    days,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(commodity: &str, modal: f64) -> PriceRecord {
        PriceRecord {
            market_label: "Test Market".into(),
            commodity: commodity.into(),
            min_price: modal - 100.0,
            max_price: modal + 100.0,
            modal_price: modal,
            trade_date: NaiveDate::from_ymd_opt(2026, 8, 27),
            state: None,
            latitude: None,
            longitude: None,
            synthetic: false,
        }
    }

    #[test]
    fn round_trips_geocode_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(GEOCODE_CACHE_FILE);
        {
            let store: JsonStore<GeocodeCacheMap> = JsonStore::load(path.clone());
            store.write(|map| {
                map.insert(
                    "kr market".into(),
                    GeocodeCacheEntry {
                        latitude: 12.96,
                        longitude: 77.58,
                        captured_at: Utc::now(),
                    },
                );
            });
        }
        let reloaded: JsonStore<GeocodeCacheMap> = JsonStore::load(path);
        let entry = reloaded.read(|map| map.get("kr market").cloned()).unwrap();
        assert!((entry.latitude - 12.96).abs() < 1e-9);
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PRICE_CACHE_FILE);
        fs::write(&path, "{ not json").unwrap();
        let store: JsonStore<PriceCacheDoc> = JsonStore::load(path);
        assert!(store.read(|doc| doc.days.is_empty()));
    }

    #[test]
    fn nested_cache_isolates_commodities() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        let mut doc = PriceCacheDoc::default();
        doc.put(date, "wheat", "x", record("Wheat", 2400.0));
        assert!(doc.get(date, "wheat", "x").is_some());
        assert!(doc.get(date, "rice", "x").is_none());
    }

    #[test]
    fn migrates_legacy_flat_file_under_recorded_commodity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PRICE_CACHE_FILE);
        let legacy = serde_json::json!({
            "2026-08-28": {
                "kr market": {
                    "market_label": "KR Market",
                    "commodity": "Wheat",
                    "min_price": 2300.0,
                    "max_price": 2500.0,
                    "modal_price": 2400.0,
                    "trade_date": "2026-08-27"
                }
            }
        });
        fs::write(&path, legacy.to_string()).unwrap();

        let store: JsonStore<PriceCacheDoc> = JsonStore::load(path);
        let date = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        store.read(|doc| {
            assert_eq!(doc.version, 2);
            let hit = doc.get(date, "wheat", "kr market").expect("migrated record");
            assert!((hit.modal_price - 2400.0).abs() < 1e-9);
            // The legacy entry answers only its own commodity.
            assert!(doc.get(date, "rice", "kr market").is_none());
        });
    }

    #[test]
    fn save_replaces_file_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(RATE_LIMITER_FILE);
        let store: JsonStore<RateLimiterStamp> = JsonStore::load(path.clone());
        store.write(|stamp| stamp.last_call = Some(Utc::now()));
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
