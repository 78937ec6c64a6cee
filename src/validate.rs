use std::collections::HashSet;

use crate::geo::{CandidateMarket, SourceTag};

const ACCEPT_TOKENS: &[&str] = &[
    "market", "mandi", "bazaar", "bazar", "wholesale", "apmc", "sabzi", "haat",
];

const REJECT_TOKENS: &[&str] = &[
    "shop",
    "supermarket",
    "restaurant",
    "mall",
    "store",
    "cafe",
    "hotel",
    "pharmacy",
];

const MIN_ACCEPTABLE_NAME_LEN: usize = 3;

/// Decides whether a discovered venue looks like a commodity market.
/// Kept behind a trait so the heuristic can be swapped or tested alone.
pub trait MarketValidator: Send + Sync {
    fn accept(&self, candidate: &CandidateMarket) -> bool;
}

/// Token-based name heuristic: marketplace words pass outright, generic
/// commercial words fail, and anything else of reasonable length passes so
/// legitimate but plain names are not thrown away.
#[derive(Debug, Default, Clone, Copy)]
pub struct NameHeuristicValidator;

impl MarketValidator for NameHeuristicValidator {
    fn accept(&self, candidate: &CandidateMarket) -> bool {
        let name = &candidate.normalized_name;
        // Blacklist first: "supermarket" must not ride in on "market".
        if REJECT_TOKENS.iter().any(|token| name.contains(token)) {
            return false;
        }
        if ACCEPT_TOKENS.iter().any(|token| name.contains(token)) {
            return true;
        }
        name.len() >= MIN_ACCEPTABLE_NAME_LEN
    }
}

/// Dedups by normalized name (first, i.e. nearest, wins), applies the
/// validator, and caps to the `max_candidates` nearest. Cache-derived
/// candidates bypass name filtering: a geocode query string carries no
/// venue metadata worth judging.
pub fn validate_and_cap(
    validator: &dyn MarketValidator,
    candidates: Vec<CandidateMarket>,
    max_candidates: usize,
) -> Vec<CandidateMarket> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: Vec<CandidateMarket> = Vec::new();
    for candidate in candidates {
        if seen.contains(&candidate.normalized_name) {
            continue;
        }
        if candidate.source != SourceTag::GeocodeCache && !validator.accept(&candidate) {
            // Rejected names do not claim the dedup slot; a same-named
            // candidate from the filter-exempt cache tier can still pass.
            continue;
        }
        seen.insert(candidate.normalized_name.clone());
        kept.push(candidate);
        if kept.len() == max_candidates {
            break;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Origin;

    fn candidate(name: &str, distance_offset: f64, source: SourceTag) -> CandidateMarket {
        let origin = Origin {
            latitude: 12.97,
            longitude: 77.59,
        };
        CandidateMarket::new(
            name.into(),
            origin.latitude + distance_offset,
            origin.longitude,
            origin,
            source,
        )
    }

    #[test]
    fn accepts_marketplace_tokens_outright() {
        let validator = NameHeuristicValidator;
        assert!(validator.accept(&candidate("KR Market", 0.01, SourceTag::Places)));
        assert!(validator.accept(&candidate("Sabzi Mandi", 0.01, SourceTag::Places)));
        assert!(validator.accept(&candidate("APMC Yard", 0.01, SourceTag::OpenGeo)));
    }

    #[test]
    fn rejects_generic_commercial_names() {
        let validator = NameHeuristicValidator;
        assert!(!validator.accept(&candidate("Family Supermarket Express", 0.01, SourceTag::Places)));
        assert!(!validator.accept(&candidate("Corner Cafe", 0.01, SourceTag::Places)));
        assert!(!validator.accept(&candidate("Grand Hotel", 0.01, SourceTag::Places)));
    }

    #[test]
    fn plain_names_pass_the_length_fallback() {
        let validator = NameHeuristicValidator;
        assert!(validator.accept(&candidate("Devanahalli Yard", 0.01, SourceTag::Places)));
        assert!(!validator.accept(&candidate("K2", 0.01, SourceTag::Places)));
    }

    #[test]
    fn cache_tier_bypasses_name_filtering() {
        let rejected_by_name = candidate("corner cafe", 0.01, SourceTag::GeocodeCache);
        let kept = validate_and_cap(&NameHeuristicValidator, vec![rejected_by_name], 6);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn rejected_name_does_not_block_cache_tier_twin() {
        let rejected = candidate("Corner Cafe", 0.01, SourceTag::Places);
        let cache_twin = candidate("corner cafe", 0.05, SourceTag::GeocodeCache);
        let kept = validate_and_cap(&NameHeuristicValidator, vec![rejected, cache_twin], 6);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source, SourceTag::GeocodeCache);
    }

    #[test]
    fn dedups_by_normalized_name_keeping_nearest() {
        let near = candidate("KR  Market", 0.01, SourceTag::Places);
        let far = candidate("kr market", 0.20, SourceTag::OpenGeo);
        let kept = validate_and_cap(&NameHeuristicValidator, vec![near, far], 6);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].distance_km < 5.0);
    }

    #[test]
    fn caps_to_requested_size() {
        let candidates: Vec<CandidateMarket> = (0..10)
            .map(|i| candidate(&format!("market {i}"), 0.01 * (i as f64 + 1.0), SourceTag::Places))
            .collect();
        let kept = validate_and_cap(&NameHeuristicValidator, candidates, 6);
        assert_eq!(kept.len(), 6);
        assert!(kept.windows(2).all(|pair| pair[0].distance_km <= pair[1].distance_km));
    }
}
