use serde::{Deserialize, Serialize};

use crate::geo::CandidateMarket;
use crate::registry::PriceRecord;

/// A ranked market with the farmer's delivery economics applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePriceResult {
    pub market_label: String,
    pub state_or_region: Option<String>,
    pub modal_price: f64,
    pub distance_km: f64,
    pub effective_price: f64,
    pub synthetic: bool,
}

/// Net price per quintal after hauling one tonne to the market and paying
/// its gate fees. Rates arrive per tonne, prices are quoted per quintal,
/// hence the division by ten.
pub fn effective_price(
    modal_price: f64,
    distance_km: f64,
    fuel_rate_per_ton_km: f64,
    mandi_fees_per_ton: f64,
) -> f64 {
    modal_price - distance_km * fuel_rate_per_ton_km / 10.0 - mandi_fees_per_ton / 10.0
}

/// Pairs each candidate with its resolved record, ranks nearest-first with
/// the better effective price breaking distance ties, and keeps the top
/// `top_n`. Unresolved slots are skipped.
pub fn rank(
    candidates: &[CandidateMarket],
    records: &[Option<PriceRecord>],
    top_n: usize,
    fuel_rate_per_ton_km: f64,
    mandi_fees_per_ton: f64,
) -> Vec<EffectivePriceResult> {
    let mut ranked: Vec<EffectivePriceResult> = candidates
        .iter()
        .zip(records.iter())
        .filter_map(|(candidate, record)| {
            let record = record.as_ref()?;
            Some(EffectivePriceResult {
                market_label: record.market_label.clone(),
                state_or_region: record.state.clone(),
                modal_price: record.modal_price,
                distance_km: candidate.distance_km,
                effective_price: effective_price(
                    record.modal_price,
                    candidate.distance_km,
                    fuel_rate_per_ton_km,
                    mandi_fees_per_ton,
                ),
                synthetic: record.synthetic,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then(b.effective_price.total_cmp(&a.effective_price))
    });
    ranked.truncate(top_n);
    ranked
}
