use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, SearchError};
use crate::models::{SearchOptions, SearchRequest, SearchResponse};
use crate::ranking::{rank, Highlighter, HitFormatter};
use crate::search::QueryExecutor;
use crate::traits::VectorIndex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, Instrument};

/// The search entry point: validates a request, embeds the query text, pulls
/// candidates and returns one diversified, paginated page.
pub struct SearchService<V: VectorIndex + ?Sized> {
    embedder: Arc<dyn Embedder>,
    executor: QueryExecutor<V>,
    options: SearchOptions,
}

impl<V: VectorIndex + ?Sized> SearchService<V> {
    pub fn new(index: Arc<V>, embedder: Arc<dyn Embedder>, options: SearchOptions) -> Self {
        let executor = QueryExecutor::new(index, options.boost_coefficient, options.candidate_window);
        Self {
            embedder,
            executor,
            options,
        }
    }

    fn validate(&self, request: &SearchRequest) -> Result<(), SearchError> {
        if request.text.trim().is_empty() {
            return Err(SearchError::Validation("query text is empty".to_string()));
        }
        if request.top_k == 0 || request.top_k > self.options.max_top_k {
            return Err(SearchError::Validation(format!(
                "top_k must be between 1 and {}, got {}",
                self.options.max_top_k, request.top_k
            )));
        }
        Ok(())
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        self.validate(request)?;

        let span = info_span!(
            "search",
            top_k = request.top_k,
            offset = request.offset,
            document_id = request.document_id
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();

        let mut vectors = self.embedder.embed(std::slice::from_ref(&request.text)).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                expected: 1,
                actual: vectors.len(),
            }
            .into());
        }
        let query_vector = vectors.remove(0);

        let candidates = self
            .executor
            .retrieve(&query_vector, &request.filters(), &request.text)
            .await?;
        let candidate_count = candidates.len();
        let page = rank(candidates, request.top_k, request.offset);

        let formatter = HitFormatter {
            preview_chars: self.options.preview_chars,
            clean_preview: request.clean_preview,
            highlighter: Highlighter::from_query(&request.text),
            highlight_terms: request.highlight_terms,
        };
        let results = page
            .results
            .into_iter()
            .map(|candidate| formatter.format(candidate))
            .collect::<Vec<_>>();

        info!(
            candidates = candidate_count,
            returned = results.len(),
            next_offset = page.next_offset,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );

        Ok(SearchResponse {
            query: request.text.clone(),
            top_k: request.top_k,
            offset: request.offset,
            next_offset: page.next_offset,
            document_filter: request.document_id,
            results,
        })
    }
}
