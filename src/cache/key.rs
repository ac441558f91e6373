//! Coarse cache-key derivation
//!
//! Keys are deliberately lossy: semantically similar requests must
//! collapse onto one key, because hit rate is the primary lever of the
//! whole layer. Age is bucketed to its decade, free-text locations are
//! reduced to their leading token, and interest lists are normalized and
//! capped.

use crate::upstream::DemographicParams;

/// Interests beyond this many do not affect the key
const MAX_KEY_INTERESTS: usize = 3;

/// Derive the cache key for an enrichment request.
///
/// The same key doubles as the in-flight deduplication key and the
/// preloader's usage signature, so it must be stable across calls.
pub fn enrichment_key(category: &str, params: &DemographicParams) -> String {
    format!(
        "{}:{}:{}:{}",
        category.trim().to_lowercase(),
        age_bucket(params.age),
        location_token(params.location.as_deref()),
        interests_signature(&params.interests),
    )
}

/// Bucket an age to its decade ("20s", "30s"); absent ages share "any".
fn age_bucket(age: Option<u32>) -> String {
    match age {
        Some(age) => format!("{}s", (age / 10) * 10),
        None => "any".to_string(),
    }
}

/// Reduce a free-text location to its leading alphanumeric token.
///
/// "Paris, France", "paris 11e" and "PARIS" all normalize to "paris".
fn location_token(location: Option<&str>) -> String {
    location
        .map(|loc| {
            loc.trim()
                .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
                .find(|token| !token.is_empty())
                .unwrap_or("")
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .unwrap_or_else(|| "any".to_string())
}

/// Lowercase, sort, dedup and cap the interest list.
fn interests_signature(interests: &[String]) -> String {
    if interests.is_empty() {
        return "none".to_string();
    }
    let mut normalized: Vec<String> = interests
        .iter()
        .map(|interest| interest.trim().to_lowercase())
        .filter(|interest| !interest.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized.truncate(MAX_KEY_INTERESTS);
    if normalized.is_empty() {
        "none".to_string()
    } else {
        normalized.join("+")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params(age: u32, location: &str) -> DemographicParams {
        DemographicParams::new().with_age(age).with_location(location)
    }

    #[test]
    fn ages_collapse_to_decade_buckets() {
        assert_eq!(
            enrichment_key("music", &params(21, "Paris")),
            enrichment_key("music", &params(29, "Paris")),
        );
        assert_ne!(
            enrichment_key("music", &params(29, "Paris")),
            enrichment_key("music", &params(30, "Paris")),
        );
    }

    #[test]
    fn locations_collapse_to_leading_token() {
        assert_eq!(
            enrichment_key("music", &params(28, "Paris, France")),
            enrichment_key("music", &params(28, "PARIS")),
        );
        assert_eq!(
            enrichment_key("brand", &params(40, "  new york ")).contains(":new:"),
            true
        );
    }

    #[test]
    fn interests_are_order_insensitive_and_capped() {
        let a = DemographicParams::new()
            .with_age(28)
            .with_interests(["Jazz", "film", "travel"]);
        let b = DemographicParams::new()
            .with_age(28)
            .with_interests(["travel", "JAZZ", "Film"]);
        assert_eq!(enrichment_key("music", &a), enrichment_key("music", &b));

        let capped = DemographicParams::new()
            .with_age(28)
            .with_interests(["a", "b", "c", "d", "e"]);
        let fewer = DemographicParams::new()
            .with_age(28)
            .with_interests(["a", "b", "c"]);
        assert_eq!(
            enrichment_key("music", &capped),
            enrichment_key("music", &fewer)
        );
    }

    #[test]
    fn absent_fields_use_placeholders() {
        let key = enrichment_key("music", &DemographicParams::new());
        assert_eq!(key, "music:any:any:none");
    }

    proptest! {
        #[test]
        fn key_is_deterministic(age in 0u32..120, loc in "[A-Za-z ]{0,20}") {
            let p = DemographicParams::new().with_age(age).with_location(loc.clone());
            prop_assert_eq!(
                enrichment_key("music", &p),
                enrichment_key("music", &p)
            );
        }

        #[test]
        fn same_decade_same_key(age in 0u32..110) {
            let base = (age / 10) * 10;
            let a = DemographicParams::new().with_age(base);
            let b = DemographicParams::new().with_age(base + 9);
            prop_assert_eq!(
                enrichment_key("brand", &a),
                enrichment_key("brand", &b)
            );
        }
    }
}
