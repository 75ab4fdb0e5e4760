// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Locale-aware fuzzy search over items/cosmetics/bundles (§4.G). Results
//! carry the caller's preferred locale name plus the canonical name, so
//! identity stays stable across locales even when display names differ.

use strsim::jaro_winkler;

use crate::model::ItemId;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub item_id: ItemId,
    pub canonical_name: String,
    pub display_name: String,
    pub score: f64,
}

/// Scores `query` against every `(id, canonical_name, names_by_locale)`
/// candidate, preferring the `locale` name when present, falling back to
/// canonical. Returns the top `limit` matches, highest score first.
pub fn fuzzy_search<'a, I>(query: &str, locale: Option<&str>, candidates: I, limit: usize) -> Vec<SearchResult>
where
    I: IntoIterator<Item = (&'a ItemId, &'a str, &'a std::collections::HashMap<String, String>)>,
{
    let needle = query.to_lowercase();
    let mut scored: Vec<SearchResult> = candidates
        .into_iter()
        .map(|(id, canonical, names_by_locale)| {
            let display_name = locale
                .and_then(|l| names_by_locale.get(l))
                .cloned()
                .unwrap_or_else(|| canonical.to_owned());
            let score = jaro_winkler(&needle, &display_name.to_lowercase())
                .max(jaro_winkler(&needle, &canonical.to_lowercase()));
            SearchResult { item_id: id.clone(), canonical_name: canonical.to_owned(), display_name, score }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn fuzzy_search_prefers_locale_name_but_keeps_canonical_identity() {
        let reyna_id: ItemId = "skin-reyna-001".into();
        let mut names = HashMap::new();
        names.insert("fr-FR".to_owned(), "Lame de Reyna".to_owned());
        let candidates = vec![(&reyna_id, "Reyna Blade", &names)];

        let results = fuzzy_search("reyna blade", Some("fr-FR"), candidates, 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].canonical_name, "Reyna Blade");
        assert_eq!(results[0].display_name, "Lame de Reyna");
    }

    #[test]
    fn fuzzy_search_truncates_to_limit_highest_scores_first() {
        let a_id: ItemId = "a".into();
        let b_id: ItemId = "b".into();
        let empty = HashMap::new();
        let candidates = vec![(&a_id, "Phantom", &empty), (&b_id, "Ghost", &empty)];

        let results = fuzzy_search("phantom", None, candidates, 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].canonical_name, "Phantom");
    }
}
