//! Diversity reduction, stable ordering and offset pagination of search
//! candidates, plus the per-hit presentation fields (score, page link,
//! cleaned and highlighted previews).

use crate::models::{SearchCandidate, SearchHit};
use crate::normalize::clean_preview;
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

/// One page of ranked candidates. `next_offset` is set only when the page is
/// full, which means "try the next offset", not "more results exist".
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPage {
    pub results: Vec<SearchCandidate>,
    pub next_offset: Option<usize>,
}

/// Order inside one `(document, section)` group: the survivor is the minimum.
fn section_order(left: &SearchCandidate, right: &SearchCandidate) -> Ordering {
    left.combined_score
        .total_cmp(&right.combined_score)
        .then_with(|| left.distance.total_cmp(&right.distance))
        .then_with(|| left.chunk_id.cmp(&right.chunk_id))
}

fn global_order(left: &SearchCandidate, right: &SearchCandidate) -> Ordering {
    left.combined_score
        .total_cmp(&right.combined_score)
        .then_with(|| left.distance.total_cmp(&right.distance))
        .then_with(|| right.lexical_hit.cmp(&left.lexical_hit))
        .then_with(|| left.chunk_id.cmp(&right.chunk_id))
}

/// Keeps the best candidate per `(document_id, section_path)`, a missing
/// section path grouping with the empty one, and returns the survivors in
/// global order.
pub fn diversify(candidates: Vec<SearchCandidate>) -> Vec<SearchCandidate> {
    let total = candidates.len();
    let mut best: HashMap<(i64, String), SearchCandidate> = HashMap::new();

    for candidate in candidates {
        let key = (
            candidate.document_id,
            candidate.section_path.clone().unwrap_or_default(),
        );
        match best.get_mut(&key) {
            Some(current) => {
                if section_order(&candidate, current) == Ordering::Less {
                    *current = candidate;
                }
            }
            None => {
                best.insert(key, candidate);
            }
        }
    }

    let mut survivors = best.into_values().collect::<Vec<_>>();
    survivors.sort_by(global_order);
    debug!(total, sections = survivors.len(), "diversified candidates");
    survivors
}

pub fn rank(candidates: Vec<SearchCandidate>, limit: usize, offset: usize) -> RankedPage {
    let results = diversify(candidates)
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>();

    let next_offset = (limit > 0 && results.len() == limit).then(|| offset + results.len());
    RankedPage {
        results,
        next_offset,
    }
}

/// Similarity in `(0, 1]`, decreasing in distance.
pub fn bounded_score(distance: f64) -> f64 {
    1.0 / (1.0 + distance.max(0.0))
}

pub fn page_url(source_url: Option<&str>, start_page: u32) -> Option<String> {
    match source_url {
        Some(source) if !source.is_empty() && start_page > 0 => {
            Some(format!("{source}#page={start_page}"))
        }
        _ => None,
    }
}

/// Wraps query terms in `**..**`, case-insensitively.
#[derive(Debug, Clone)]
pub struct Highlighter {
    pattern: Regex,
}

impl Highlighter {
    /// Terms are the ASCII-alphanumeric runs of the query that are at least
    /// three characters long. Returns `None` when the query has no such term.
    pub fn from_query(query: &str) -> Option<Self> {
        let mut terms: Vec<String> = Vec::new();
        for term in query
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|term| term.len() >= 3)
        {
            if !terms.iter().any(|seen| seen == term) {
                terms.push(term.to_string());
            }
        }
        if terms.is_empty() {
            return None;
        }

        let alternation = terms
            .iter()
            .map(|term| regex::escape(term))
            .collect::<Vec<_>>()
            .join("|");
        match RegexBuilder::new(&alternation).case_insensitive(true).build() {
            Ok(pattern) => Some(Self { pattern }),
            Err(error) => {
                debug!(%error, "highlight pattern rejected");
                None
            }
        }
    }

    pub fn mark(&self, text: &str) -> String {
        self.pattern.replace_all(text, "**${0}**").into_owned()
    }
}

/// Presentation settings applied to every hit of one response.
pub struct HitFormatter {
    pub preview_chars: usize,
    pub clean_preview: bool,
    pub highlighter: Option<Highlighter>,
    pub highlight_terms: bool,
}

impl HitFormatter {
    pub fn format(&self, candidate: SearchCandidate) -> SearchHit {
        let preview = candidate
            .content
            .chars()
            .take(self.preview_chars)
            .collect::<String>();
        let cleaned = clean_preview(&preview);

        // Highlighting runs on the cleaned preview only.
        let preview_marked = self.highlight_terms.then(|| match &self.highlighter {
            Some(highlighter) => highlighter.mark(&cleaned),
            None => cleaned.clone(),
        });

        SearchHit {
            chunk_id: candidate.chunk_id,
            distance: candidate.distance,
            score: bounded_score(candidate.distance),
            document_id: candidate.document_id,
            page_url: page_url(candidate.source_url.as_deref(), candidate.start_page),
            document_title: candidate.document_title,
            source_url: candidate.source_url,
            section_path: candidate.section_path,
            chunk_index: candidate.chunk_index,
            start_page: candidate.start_page,
            end_page: candidate.end_page,
            preview,
            preview_clean: self.clean_preview.then_some(cleaned),
            preview_marked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn candidate(
        chunk_id: i64,
        document_id: i64,
        section: Option<&str>,
        distance: f64,
        lexical_hit: u8,
    ) -> SearchCandidate {
        SearchCandidate {
            chunk_id,
            document_id,
            document_title: Some("Manual".to_string()),
            source_url: Some("https://example.com/manual.pdf".to_string()),
            section_path: section.map(str::to_string),
            chunk_index: 0,
            start_page: 3,
            end_page: 4,
            content: format!("content of chunk {chunk_id}"),
            distance,
            lexical_hit,
            combined_score: distance - 0.05 * f64::from(lexical_hit),
        }
    }

    fn ids(candidates: &[SearchCandidate]) -> Vec<i64> {
        candidates.iter().map(|c| c.chunk_id).collect()
    }

    #[test]
    fn keeps_one_candidate_per_section() {
        let ranked = rank(
            vec![
                candidate(1, 1, Some("A"), 0.40, 0),
                candidate(2, 1, Some("A"), 0.30, 0),
                candidate(3, 1, Some("B"), 0.35, 0),
                candidate(4, 2, Some("A"), 0.50, 0),
            ],
            10,
            0,
        );
        assert_eq!(ids(&ranked.results), vec![2, 3, 4]);
        assert_eq!(ranked.next_offset, None);
    }

    #[test]
    fn missing_section_groups_with_empty_section() {
        let ranked = rank(
            vec![
                candidate(1, 1, None, 0.2, 0),
                candidate(2, 1, Some(""), 0.1, 0),
            ],
            10,
            0,
        );
        assert_eq!(ids(&ranked.results), vec![2]);
    }

    #[test]
    fn lexical_boost_breaks_near_ties_only() {
        let ranked = rank(
            vec![
                candidate(1, 1, Some("A"), 0.42, 0),
                candidate(2, 1, Some("B"), 0.44, 1),
                candidate(3, 1, Some("C"), 0.10, 0),
            ],
            10,
            0,
        );
        assert_eq!(ids(&ranked.results), vec![3, 2, 1]);
    }

    #[test]
    fn equal_scores_fall_back_to_lowest_chunk_id() {
        let forward = rank(
            vec![
                candidate(9, 1, Some("A"), 0.3, 0),
                candidate(4, 1, Some("A"), 0.3, 0),
                candidate(7, 1, Some("B"), 0.3, 0),
            ],
            10,
            0,
        );
        let reversed = rank(
            vec![
                candidate(7, 1, Some("B"), 0.3, 0),
                candidate(4, 1, Some("A"), 0.3, 0),
                candidate(9, 1, Some("A"), 0.3, 0),
            ],
            10,
            0,
        );
        assert_eq!(ids(&forward.results), vec![4, 7]);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn full_page_sets_next_offset() {
        let candidates = (1..=5)
            .map(|id| candidate(id, 1, Some(&format!("S{id}")), id as f64 / 10.0, 0))
            .collect::<Vec<_>>();

        let first = rank(candidates.clone(), 3, 0);
        assert_eq!(ids(&first.results), vec![1, 2, 3]);
        assert_eq!(first.next_offset, Some(3));

        let second = rank(candidates, 3, 3);
        assert_eq!(ids(&second.results), vec![4, 5]);
        assert_eq!(second.next_offset, None);
    }

    #[test]
    fn zero_limit_returns_an_empty_final_page() {
        let ranked = rank(vec![candidate(1, 1, Some("A"), 0.1, 0)], 0, 0);
        assert!(ranked.results.is_empty());
        assert_eq!(ranked.next_offset, None);
    }

    #[test]
    fn score_and_page_url() {
        assert_eq!(bounded_score(0.0), 1.0);
        assert!((bounded_score(1.0) - 0.5).abs() < 1e-12);
        assert_eq!(
            page_url(Some("file:///m.pdf"), 12).as_deref(),
            Some("file:///m.pdf#page=12")
        );
        assert_eq!(page_url(Some("file:///m.pdf"), 0), None);
        assert_eq!(page_url(Some(""), 3), None);
        assert_eq!(page_url(None, 3), None);
    }

    #[test]
    fn highlighter_marks_terms_case_insensitively() {
        let highlighter = Highlighter::from_query("Hydraulic-pump of x").unwrap();
        assert_eq!(
            highlighter.mark("HYDRAULIC pump, of course"),
            "**HYDRAULIC** **pump**, of course"
        );
        assert!(Highlighter::from_query("a of to").is_none());
    }

    #[test]
    fn formatter_highlights_the_cleaned_preview() {
        let mut source = candidate(1, 1, Some("A"), 1.0, 1);
        source.content = "Pump   maintenance\n12\nCheck the pump".to_string();
        let formatter = HitFormatter {
            preview_chars: 300,
            clean_preview: true,
            highlighter: Highlighter::from_query("pump"),
            highlight_terms: true,
        };

        let hit = formatter.format(source);
        assert_eq!(hit.preview, "Pump   maintenance\n12\nCheck the pump");
        assert_eq!(hit.preview_clean.as_deref(), Some("Pump maintenance\nCheck the pump"));
        assert_eq!(
            hit.preview_marked.as_deref(),
            Some("**Pump** maintenance\nCheck the **pump**")
        );
        assert_eq!(hit.page_url.as_deref(), Some("https://example.com/manual.pdf#page=3"));
        assert!((hit.score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn formatter_omits_optional_previews_when_disabled() {
        let formatter = HitFormatter {
            preview_chars: 5,
            clean_preview: false,
            highlighter: None,
            highlight_terms: false,
        };
        let hit = formatter.format(candidate(1, 1, Some("A"), 0.2, 0));
        assert_eq!(hit.preview, "conte");
        assert_eq!(hit.preview_clean, None);
        assert_eq!(hit.preview_marked, None);
    }

    fn arbitrary_candidates() -> impl Strategy<Value = Vec<SearchCandidate>> {
        prop::collection::vec(
            (1i64..3, prop::option::of(0u8..4), 0u32..20, 0u8..2),
            0..40,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(index, (document_id, section, distance, hit))| {
                    let section = section.map(|s| format!("S{s}"));
                    candidate(
                        index as i64 + 1,
                        document_id,
                        section.as_deref(),
                        f64::from(distance) / 10.0,
                        hit,
                    )
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn survivors_have_distinct_sections(candidates in arbitrary_candidates()) {
            let survivors = diversify(candidates);
            let keys = survivors
                .iter()
                .map(|c| (c.document_id, c.section_path.clone().unwrap_or_default()))
                .collect::<HashSet<_>>();
            prop_assert_eq!(keys.len(), survivors.len());
        }

        #[test]
        fn ranking_ignores_arrival_order(candidates in arbitrary_candidates()) {
            let mut reversed = candidates.clone();
            reversed.reverse();
            prop_assert_eq!(rank(candidates, 5, 0), rank(reversed, 5, 0));
        }
    }
}
