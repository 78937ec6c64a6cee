use httptest::matchers::{all_of, request};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use serde_json::json;
use tempfile::tempdir;

use mandi_finder::{AppConfig, MarketFinder, Origin, PriceQuery};

const ORIGIN: Origin = Origin {
    latitude: 12.97,
    longitude: 77.59,
};

#[tokio::test]
async fn empty_tiers_yield_empty_results_and_synthetic_series() {
    let server = Server::run();

    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/v1/places:searchText")
        ))
        .times(1..)
        .respond_with(json_encoded(json!({}))),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/overpass")
        ))
        .times(1..)
        .respond_with(json_encoded(json!({ "elements": [] }))),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/registry/agmarknet/prices")
        ))
        .times(1)
        .respond_with(json_encoded(json!([]))),
    );

    std::env::set_var("PLACES_API_BASE", server.url("/v1").to_string());
    std::env::set_var("PLACES_API_KEY", "test-places-key");
    std::env::set_var("GEOCODE_API_BASE", server.url("/geo").to_string());
    std::env::set_var("REGISTRY_API_BASE", server.url("/registry").to_string());
    std::env::set_var("OPEN_GEO_ENDPOINTS", server.url("/overpass").to_string());
    std::env::set_var("GEOCODE_MIN_INTERVAL_MS", "0");

    let data_dir = tempdir().unwrap();
    let finder = MarketFinder::new(AppConfig::from_env(), data_dir.path()).expect("finder");

    let ranked = finder
        .find_nearest_markets("Onion", ORIGIN, 25.0, 5, 8.0, 50.0)
        .await
        .expect("empty result");
    assert!(ranked.is_empty());

    let query = PriceQuery::commodity("Onion").with_market("Ghost Yard");
    let series = finder.fetch_prices(&query).await;
    assert_eq!(series.len(), 7);
    assert!(series.iter().all(|record| record.synthetic));
    assert!(series.iter().all(|record| record.modal_price > 0.0));

    let forecast = finder.forecast_prices(&series);
    assert_eq!(forecast.len(), 14);
    assert!(forecast.iter().all(|p| p.predicted_modal_price > 0.0));
}
