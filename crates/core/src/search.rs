use crate::error::SearchError;
use crate::models::{NeighborRow, QueryFilters, SearchCandidate};
use crate::traits::VectorIndex;
use std::sync::Arc;
use tracing::debug;

/// Pulls scored candidates from a [`VectorIndex`]. The output is not
/// de-duplicated; feed it through [`crate::ranking::rank`] before paging.
pub struct QueryExecutor<V: VectorIndex + ?Sized> {
    index: Arc<V>,
    boost_coefficient: f64,
    candidate_window: Option<usize>,
}

impl<V: VectorIndex + ?Sized> QueryExecutor<V> {
    pub fn new(index: Arc<V>, boost_coefficient: f64, candidate_window: Option<usize>) -> Self {
        Self {
            index,
            boost_coefficient,
            candidate_window,
        }
    }

    pub async fn retrieve(
        &self,
        query_vector: &[f32],
        filters: &QueryFilters,
        lexical_term: &str,
    ) -> Result<Vec<SearchCandidate>, SearchError> {
        let rows = self
            .index
            .nearest_chunks(query_vector, filters, self.candidate_window)
            .await?;

        let needle = lexical_term.to_lowercase();
        let candidates = rows
            .into_iter()
            .map(|row| score_row(row, &needle, self.boost_coefficient))
            .collect::<Vec<_>>();

        debug!(
            candidates = candidates.len(),
            lexical_hits = candidates.iter().filter(|c| c.lexical_hit == 1).count(),
            "retrieved candidates"
        );
        Ok(candidates)
    }
}

fn score_row(row: NeighborRow, needle: &str, boost_coefficient: f64) -> SearchCandidate {
    let lexical_hit = u8::from(!needle.is_empty() && row.content.to_lowercase().contains(needle));
    let combined_score = row.distance - boost_coefficient * f64::from(lexical_hit);

    SearchCandidate {
        chunk_id: row.chunk_id,
        document_id: row.document_id,
        document_title: row.document_title,
        source_url: row.source_url,
        section_path: row.section_path,
        chunk_index: row.chunk_index,
        start_page: row.start_page,
        end_page: row.end_page,
        content: row.content,
        distance: row.distance,
        lexical_hit,
        combined_score,
    }
}
