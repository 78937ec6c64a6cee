use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::debug;

use crate::geo::{haversine_km, normalize_name, CandidateMarket, Origin};
use crate::geocode::GeocodeService;
use crate::registry::{PriceQuery, PriceRecord, RegistryService};
use crate::store::{JsonStore, PriceCacheDoc, PRICE_CACHE_FILE};

const SUBSTRING_MATCH_SCORE: i64 = 100;
const POSITIVE_MODAL_SCORE: i64 = 10;
const REGION_GEOCODE_ROW_LIMIT: usize = 50;

/// Per-day price cache over the nested (date, commodity, market) store.
pub struct PriceCache {
    store: JsonStore<PriceCacheDoc>,
}

impl PriceCache {
    pub fn load(data_dir: &Path) -> Self {
        Self {
            store: JsonStore::load(data_dir.join(PRICE_CACHE_FILE)),
        }
    }

    pub fn get(&self, date: NaiveDate, commodity: &str, market: &str) -> Option<PriceRecord> {
        let commodity = normalize_name(commodity);
        let market = normalize_name(market);
        self.store
            .read(|doc| doc.get(date, &commodity, &market).cloned())
    }

    pub fn put(&self, date: NaiveDate, commodity: &str, market: &str, record: PriceRecord) {
        let commodity = normalize_name(commodity);
        let market = normalize_name(market);
        self.store
            .write(|doc| doc.put(date, &commodity, &market, record));
    }
}

/// Resolves the best-matching price record for a (commodity, candidate)
/// pair: cache, then a market-filtered registry query, then a relaxed
/// statewide query, then a region-wide geographic recovery. Returns `None`
/// on total exhaustion; synthesizing a placeholder is the caller's call.
pub struct PriceLookup {
    registry: Arc<RegistryService>,
    geocode: Arc<GeocodeService>,
    cache: Arc<PriceCache>,
}

impl PriceLookup {
    pub fn new(
        registry: Arc<RegistryService>,
        geocode: Arc<GeocodeService>,
        cache: Arc<PriceCache>,
    ) -> Self {
        Self {
            registry,
            geocode,
            cache,
        }
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub async fn lookup_price(
        &self,
        commodity: &str,
        candidate: &CandidateMarket,
        origin: Origin,
    ) -> Option<PriceRecord> {
        let today = Utc::now().date_naive();
        if let Some(hit) = self.cache.get(today, commodity, &candidate.normalized_name) {
            debug!(market = %candidate.normalized_name, "price cache hit");
            return Some(hit);
        }

        let record = match self.market_filtered(commodity, candidate).await {
            Some(record) => Some(record),
            None => match self.statewide_relaxed(commodity, candidate, origin).await {
                Some(record) => Some(record),
                None => self.region_wide_nearest(commodity, origin).await,
            },
        }?;

        self.cache
            .put(today, commodity, &candidate.normalized_name, record.clone());
        Some(record)
    }

    /// Step 2: provider-side market filter, best-scored row wins.
    async fn market_filtered(
        &self,
        commodity: &str,
        candidate: &CandidateMarket,
    ) -> Option<PriceRecord> {
        let query = PriceQuery::commodity(commodity).with_market(&candidate.raw_name);
        let rows = self.registry.query_registries(&query).await;
        pick_best(rows, &candidate.normalized_name)
    }

    /// Step 3: market filter dropped, narrowed to the origin's state, with
    /// a whole-row text fallback to catch divergent naming conventions.
    async fn statewide_relaxed(
        &self,
        commodity: &str,
        candidate: &CandidateMarket,
        origin: Origin,
    ) -> Option<PriceRecord> {
        let mut query = PriceQuery::commodity(commodity);
        if let Some(region) = self.geocode.resolve_region(origin).await {
            if let Some(state) = region.state {
                query = query.with_state(&state);
            }
        }
        let rows = self.registry.query_registries(&query).await;
        let matching: Vec<PriceRecord> = rows
            .into_iter()
            .filter(|row| {
                let label = normalize_name(&row.market_label);
                names_overlap(&label, &candidate.normalized_name)
                    || whole_row_text(row).contains(&candidate.normalized_name)
            })
            .collect();
        pick_best(matching, &candidate.normalized_name)
    }

    /// Step 4: region-wide commodity query; geocode each returned market
    /// label (bounded) and take the geographically nearest.
    async fn region_wide_nearest(&self, commodity: &str, origin: Origin) -> Option<PriceRecord> {
        let region = self.geocode.resolve_region(origin).await?;
        let state = region.state?;
        let query = PriceQuery::commodity(commodity).with_state(&state);
        let rows = self.registry.query_registries(&query).await;

        let mut nearest: Option<(f64, PriceRecord)> = None;
        for mut row in rows.into_iter().take(REGION_GEOCODE_ROW_LIMIT) {
            let Some((latitude, longitude)) = self
                .geocode
                .resolve_coordinates(&row.market_label, Some(&state))
                .await
            else {
                continue;
            };
            let distance =
                haversine_km(origin.latitude, origin.longitude, latitude, longitude);
            if nearest.as_ref().is_none_or(|(best, _)| distance < *best) {
                row.latitude = Some(latitude);
                row.longitude = Some(longitude);
                nearest = Some((distance, row));
            }
        }
        nearest.map(|(_, record)| record)
    }
}

fn names_overlap(label: &str, candidate: &str) -> bool {
    !label.is_empty() && (label.contains(candidate) || candidate.contains(label))
}

fn whole_row_text(row: &PriceRecord) -> String {
    let mut text = normalize_name(&row.market_label);
    text.push(' ');
    text.push_str(&normalize_name(&row.commodity));
    if let Some(state) = &row.state {
        text.push(' ');
        text.push_str(&normalize_name(state));
    }
    text
}

fn score_row(row: &PriceRecord, candidate_name: &str) -> i64 {
    let label = normalize_name(&row.market_label);
    let mut score = 0;
    if names_overlap(&label, candidate_name) {
        score += SUBSTRING_MATCH_SCORE;
    }
    if row.modal_price > 0.0 {
        score += POSITIVE_MODAL_SCORE;
    }
    score
}

fn pick_best(rows: Vec<PriceRecord>, candidate_name: &str) -> Option<PriceRecord> {
    rows.into_iter().max_by(|a, b| {
        score_row(a, candidate_name)
            .cmp(&score_row(b, candidate_name))
            .then(a.trade_date.cmp(&b.trade_date))
    })
}
