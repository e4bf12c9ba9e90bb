use crate::error::SearchError;
use crate::models::{SearchHit, SearchRequest, SearchResponse};
use crate::orchestrator::SearchService;
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Anything that answers one page of a search.
#[async_trait]
pub trait SearchEndpoint: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError>;
}

#[async_trait]
impl<V: VectorIndex + ?Sized> SearchEndpoint for SearchService<V> {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        SearchService::search(self, request).await
    }
}

/// Remote search server reached with `POST <base>/search`.
pub struct HttpSearchClient {
    client: Client,
    endpoint: Url,
}

impl HttpSearchClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SearchError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("search")?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SearchEndpoint for HttpSearchClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: self.endpoint.to_string(),
                details: format!("{status}: {}", body.chars().take(500).collect::<String>()),
            });
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectedResults {
    pub hits: Vec<SearchHit>,
    pub pages_fetched: usize,
    /// Set when the page ceiling stopped collection before the server
    /// signalled the end.
    pub truncated: bool,
}

/// Follows `next_offset` from offset 0 until the endpoint stops returning a
/// cursor, dropping hits whose `(document_id, chunk_index)` was already seen.
#[derive(Debug, Clone, Copy)]
pub struct ResultPaginator {
    page_size: usize,
    max_pages: usize,
}

impl ResultPaginator {
    pub const DEFAULT_MAX_PAGES: usize = 100;

    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            max_pages: Self::DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub async fn collect_all<E: SearchEndpoint + ?Sized>(
        &self,
        endpoint: &E,
        query: &SearchRequest,
    ) -> Result<CollectedResults, SearchError> {
        let mut request = query.clone();
        request.top_k = self.page_size;
        request.offset = 0;

        let mut seen = HashSet::new();
        let mut collected = CollectedResults::default();

        loop {
            let response = endpoint.search(&request).await?;
            collected.pages_fetched += 1;

            let received = response.results.len();
            for hit in response.results {
                if seen.insert((hit.document_id, hit.chunk_index)) {
                    collected.hits.push(hit);
                }
            }
            debug!(
                offset = request.offset,
                received,
                unique = collected.hits.len(),
                "collected page"
            );

            let Some(next_offset) = response.next_offset else {
                break;
            };
            if next_offset <= request.offset {
                warn!(
                    offset = request.offset,
                    next_offset, "endpoint returned a non-advancing cursor; stopping"
                );
                break;
            }
            if collected.pages_fetched >= self.max_pages {
                warn!(
                    max_pages = self.max_pages,
                    "page ceiling reached before the last page"
                );
                collected.truncated = true;
                break;
            }
            request.offset = next_offset;
        }

        Ok(collected)
    }
}
