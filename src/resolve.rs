use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::geo::{CandidateMarket, Origin};
use crate::lookup::PriceLookup;
use crate::registry::PriceRecord;

/// Resolves prices for a batch of candidates concurrently. Cache hits are
/// answered inline; the remainder fan out under a worker cap and a single
/// overall deadline. Output order mirrors the input; slots whose lookup
/// failed or missed the deadline come back as `None`.
pub async fn resolve_batch(
    lookup: Arc<PriceLookup>,
    commodity: &str,
    candidates: &[CandidateMarket],
    origin: Origin,
    max_workers: usize,
    overall_timeout: Duration,
) -> Vec<Option<PriceRecord>> {
    let mut results: Vec<Option<PriceRecord>> = vec![None; candidates.len()];
    if candidates.is_empty() {
        return results;
    }

    let workers = max_workers.clamp(1, candidates.len());
    let permits = Arc::new(Semaphore::new(workers));
    let mut pending = FuturesUnordered::new();

    for (index, candidate) in candidates.iter().enumerate() {
        let lookup = lookup.clone();
        let permits = permits.clone();
        let commodity = commodity.to_string();
        let candidate = candidate.clone();
        pending.push(async move {
            // Acquire never fails: the semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            let record = lookup.lookup_price(&commodity, &candidate, origin).await;
            (index, record)
        });
    }

    let drain = async {
        while let Some((index, record)) = pending.next().await {
            results[index] = record;
        }
    };
    if timeout(overall_timeout, drain).await.is_err() {
        warn!(
            timeout_secs = overall_timeout.as_secs(),
            "batch price resolution hit the overall deadline, returning partial results"
        );
    }
    debug!(
        resolved = results.iter().filter(|r| r.is_some()).count(),
        total = results.len(),
        "batch price resolution finished"
    );
    results
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tempfile::tempdir;

    use super::*;
    use crate::config::AppConfig;
    use crate::errors::AppResult;
    use crate::geo::{RegionInfo, SourceTag};
    use crate::geocode::{GeocodeService, Geocoder};
    use crate::lookup::PriceCache;
    use crate::registry::{PriceQuery, PriceRegistry, RegistryService};

    struct NullGeocoder;

    #[async_trait]
    impl Geocoder for NullGeocoder {
        async fn geocode(&self, _query: &str) -> AppResult<Option<(f64, f64)>> {
            Ok(None)
        }

        async fn reverse(&self, _lat: f64, _lon: f64) -> AppResult<Option<RegionInfo>> {
            Ok(None)
        }
    }

    /// Answers the market-filtered query instantly for "fast" markets and
    /// stalls well past the test deadline for everything else.
    struct SlowRegistry;

    #[async_trait]
    impl PriceRegistry for SlowRegistry {
        async fn query(&self, query: &PriceQuery) -> AppResult<Vec<PriceRecord>> {
            let market = query.market.clone().unwrap_or_default();
            if !market.contains("fast") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(vec![PriceRecord {
                market_label: market,
                commodity: query.commodity.clone(),
                min_price: 1900.0,
                max_price: 2100.0,
                modal_price: 2000.0,
                trade_date: None,
                state: None,
                latitude: None,
                longitude: None,
                synthetic: false,
            }])
        }
    }

    fn lookup_over(registry: Arc<dyn PriceRegistry>, dir: &std::path::Path) -> Arc<PriceLookup> {
        let mut config = AppConfig::from_env();
        config.geocode_min_interval_ms = 0;
        Arc::new(PriceLookup::new(
            Arc::new(RegistryService::from_parts(registry, None)),
            Arc::new(GeocodeService::from_parts(Arc::new(NullGeocoder), &config, dir)),
            Arc::new(PriceCache::load(dir)),
        ))
    }

    fn candidate(name: &str) -> CandidateMarket {
        CandidateMarket::new(name.into(), 13.0, 77.6, origin(), SourceTag::Places)
    }

    fn origin() -> Origin {
        Origin {
            latitude: 12.97,
            longitude: 77.59,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_partial_results_in_input_order() {
        let dir = tempdir().unwrap();
        let lookup = lookup_over(Arc::new(SlowRegistry), dir.path());
        let candidates = vec![
            candidate("slow yard"),
            candidate("fast mandi"),
            candidate("another slow yard"),
        ];

        let results = resolve_batch(
            lookup,
            "Tomato",
            &candidates,
            origin(),
            4,
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_none());
        assert_eq!(results[1].as_ref().unwrap().market_label, "fast mandi");
        assert!(results[2].is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let dir = tempdir().unwrap();
        let lookup = lookup_over(Arc::new(SlowRegistry), dir.path());
        let results =
            resolve_batch(lookup, "Tomato", &[], origin(), 4, Duration::from_secs(5)).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn worker_cap_still_resolves_every_candidate() {
        let dir = tempdir().unwrap();
        let lookup = lookup_over(Arc::new(SlowRegistry), dir.path());
        let candidates = vec![
            candidate("fast a"),
            candidate("fast b"),
            candidate("fast c"),
        ];
        let results = resolve_batch(
            lookup,
            "Tomato",
            &candidates,
            origin(),
            1,
            Duration::from_secs(10),
        )
        .await;
        assert!(results.iter().all(|r| r.is_some()));
        assert_eq!(results[2].as_ref().unwrap().market_label, "fast c");
    }
}
