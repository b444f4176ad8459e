//! Heuristic matching of unlinked listings to canonical products.
//!
//! A candidate matches when its brand equals the product's brand after
//! normalisation, its model equals the product's model (or, when the
//! marketplace exposes no model field, its title contains the model), and its
//! price is within the configured relative tolerance. Among matches the
//! closest price wins; an exact tie is ambiguous and matches nothing.

use crate::adapter::SnapshotEntry;
use crate::catalog_port::ProductSnapshot;
use crate::config::HeuristicConfig;

const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched { external_id: String, score: f64 },
    Ambiguous(Vec<String>),
    NoMatch,
}

/// Lowercase alphanumerics only: `"Louis-Vuitton "` and `"louis vuitton"` agree.
pub fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Score in `(0, 1]`, higher is closer; `None` when the entry does not match.
pub fn score(product: &ProductSnapshot, entry: &SnapshotEntry, config: &HeuristicConfig) -> Option<f64> {
    let brand = normalize(&product.brand);
    let model = normalize(&product.model);
    if brand.is_empty() || model.is_empty() {
        return None;
    }

    if normalize(entry.brand.as_deref()?) != brand {
        return None;
    }

    let model_matches = match &entry.model {
        Some(m) => normalize(m) == model,
        None => entry
            .title
            .as_deref()
            .is_some_and(|title| normalize(title).contains(&model)),
    };
    if !model_matches {
        return None;
    }

    let distance = product.price.relative_distance(entry.price?);
    (distance <= config.price_tolerance).then(|| 1.0 - distance)
}

pub fn best_match<'a>(
    product: &ProductSnapshot,
    candidates: impl IntoIterator<Item = &'a SnapshotEntry>,
    config: &HeuristicConfig,
) -> MatchResult {
    let mut scored: Vec<(&'a SnapshotEntry, f64)> = candidates
        .into_iter()
        .filter_map(|entry| score(product, entry, config).map(|s| (entry, s)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let Some(&(best, best_score)) = scored.first() else {
        return MatchResult::NoMatch;
    };
    let tied: Vec<String> = scored
        .iter()
        .take_while(|(_, s)| (best_score - s).abs() < TIE_EPSILON)
        .map(|(e, _)| e.external_id.clone())
        .collect();

    if tied.len() > 1 {
        MatchResult::Ambiguous(tied)
    } else {
        MatchResult::Matched {
            external_id: best.external_id.clone(),
            score: best_score,
        }
    }
}
