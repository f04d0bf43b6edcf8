//! Expands a partial filter request into the concrete combinations it denotes.

use crate::catalog::FilterCatalog;
use crate::types::{FilterCombination, FilterDimension, FilterRequest};

/// Token selecting every value of a dimension.
pub const ALL_TOKEN: &str = "ALL";

/// Cross-product expansion of `request` over `catalog`.
///
/// Dimensions are taken in catalog order and the first dimension varies
/// slowest, so identical inputs always yield the identical sequence. A
/// dimension missing from the request is treated as an empty token. An empty
/// catalog yields a single empty combination.
pub fn expand_filter(catalog: &FilterCatalog, request: &FilterRequest) -> Vec<FilterCombination> {
    for name in request.keys().filter(|name| catalog.get(name).is_none()) {
        tracing::debug!(filter = %name, "Ignoring token for unknown filter dimension");
    }

    let mut combinations = vec![FilterCombination::new()];

    for dimension in catalog.dimensions() {
        let token = request.get(&dimension.name).map(String::as_str).unwrap_or("");
        let values = resolve_token(dimension, token);

        combinations = combinations
            .into_iter()
            .flat_map(|partial| {
                values.iter().map(move |value| {
                    let mut combination = partial.clone();
                    combination.insert(dimension.name.clone(), value.clone());
                    combination
                })
            })
            .collect();
    }

    combinations
}

/// The values a single token selects for `dimension`.
///
/// Literal lists are not checked against the dimension's values.
pub fn resolve_token(dimension: &FilterDimension, token: &str) -> Vec<String> {
    let token = token.trim();

    if token == ALL_TOKEN {
        return dimension.values.clone();
    }

    let mut values: Vec<String> = Vec::new();
    for value in token
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|v| !v.is_empty())
    {
        if !values.iter().any(|seen| seen == value) {
            values.push(value.to_string());
        }
    }

    if values.is_empty() {
        vec![dimension.default.clone()]
    } else {
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> FilterCatalog {
        FilterCatalog::new([
            FilterDimension::new("COUNTRY", 1, ["IN", "US"], "IN"),
            FilterDimension::new("SUBSCRIPTION", 2, ["FREE", "PAID"], "FREE"),
        ])
    }

    fn request(pairs: &[(&str, &str)]) -> FilterRequest {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn combo(pairs: &[(&str, &str)]) -> FilterCombination {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_all_with_default() {
        let expanded = expand_filter(
            &catalog(),
            &request(&[("COUNTRY", "ALL"), ("SUBSCRIPTION", "")]),
        );
        assert_eq!(
            expanded,
            vec![
                combo(&[("COUNTRY", "IN"), ("SUBSCRIPTION", "FREE")]),
                combo(&[("COUNTRY", "US"), ("SUBSCRIPTION", "FREE")]),
            ]
        );
    }

    #[test]
    fn test_empty_request_yields_defaults() {
        let catalog = catalog();
        for req in [
            request(&[]),
            request(&[("COUNTRY", ""), ("SUBSCRIPTION", "")]),
            request(&[("COUNTRY", " , ")]),
        ] {
            assert_eq!(expand_filter(&catalog, &req), vec![catalog.defaults()]);
        }
    }

    #[test]
    fn test_all_is_complete_for_every_other_combination() {
        let catalog = FilterCatalog::new([
            FilterDimension::new("COUNTRY", 1, ["IN", "US", "UK"], "IN"),
            FilterDimension::new("SUBSCRIPTION", 2, ["FREE", "PAID"], "FREE"),
            FilterDimension::new("OS", 3, ["LG", "SONY"], "LG"),
        ]);
        let expanded = expand_filter(
            &catalog,
            &request(&[("COUNTRY", "ALL"), ("SUBSCRIPTION", "ALL"), ("OS", "SONY")]),
        );
        assert_eq!(expanded.len(), 6);

        for subscription in ["FREE", "PAID"] {
            let countries: Vec<_> = expanded
                .iter()
                .filter(|c| c.get("SUBSCRIPTION") == Some(subscription))
                .map(|c| c.get("COUNTRY").unwrap())
                .collect();
            assert_eq!(countries, vec!["IN", "US", "UK"]);
        }
    }

    #[test]
    fn test_literal_list_is_lenient_and_ordered() {
        let expanded = expand_filter(
            &catalog(),
            &request(&[("COUNTRY", "US, IN  XX,US"), ("SUBSCRIPTION", "PAID")]),
        );
        let countries: Vec<_> = expanded.iter().map(|c| c.get("COUNTRY").unwrap()).collect();
        assert_eq!(countries, vec!["US", "IN", "XX"]);
    }

    #[test]
    fn test_first_dimension_varies_slowest() {
        let expanded = expand_filter(
            &catalog(),
            &request(&[("COUNTRY", "ALL"), ("SUBSCRIPTION", "ALL")]),
        );
        let keys: Vec<_> = expanded.iter().map(|c| c.canonical_key()).collect();
        assert_eq!(
            keys,
            vec![
                "COUNTRY=IN,SUBSCRIPTION=FREE",
                "COUNTRY=IN,SUBSCRIPTION=PAID",
                "COUNTRY=US,SUBSCRIPTION=FREE",
                "COUNTRY=US,SUBSCRIPTION=PAID",
            ]
        );
    }

    #[test]
    fn test_deterministic() {
        let catalog = catalog();
        let req = request(&[("COUNTRY", "ALL"), ("SUBSCRIPTION", "PAID,FREE"), ("UNKNOWN", "x")]);
        assert_eq!(expand_filter(&catalog, &req), expand_filter(&catalog, &req));
    }

    #[test]
    fn test_empty_catalog() {
        let expanded = expand_filter(&FilterCatalog::default(), &request(&[("COUNTRY", "IN")]));
        assert_eq!(expanded, vec![FilterCombination::new()]);
    }

    #[test]
    fn test_unset_default() {
        let catalog = FilterCatalog::new([FilterDimension::new("OS", 1, ["LG"], "")]);
        let expanded = expand_filter(&catalog, &request(&[]));
        assert_eq!(expanded, vec![combo(&[("OS", "")])]);
    }
}
