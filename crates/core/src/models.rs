use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Fixed embedding width shared by the schema, the providers and the index.
pub const EMBEDDING_DIMENSIONS: usize = 1536;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub source_url: String,
    pub local_path: Option<String>,
    pub page_count: Option<u32>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewDocument {
    pub title: String,
    pub source_url: String,
    pub local_path: Option<String>,
}

/// One outline entry as read from the PDF, ordered by `order_index`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeadingEntry {
    pub level: u32,
    pub title: String,
    pub start_page: u32,
    pub order_index: i64,
}

impl HeadingEntry {
    /// Builds an entry from untrusted outline data, clamping level and page to 1.
    pub fn new(level: u32, title: impl Into<String>, start_page: u32, order_index: i64) -> Self {
        Self {
            level: level.max(1),
            title: title.into().trim().to_string(),
            start_page: start_page.max(1),
            order_index,
        }
    }
}

/// Inclusive page span covered by a heading and all of its descendants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionRange {
    pub level: u32,
    pub title: String,
    pub start_page: u32,
    pub end_page: u32,
    pub order_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageText {
    pub document_id: i64,
    pub page_number: u32,
    pub content: String,
}

/// A chunk as emitted by the builder, before the store assigns it an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub document_id: i64,
    pub section_path: String,
    pub level: u32,
    pub start_page: u32,
    pub end_page: u32,
    pub chunk_index: u32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredChunk {
    pub id: i64,
    #[serde(flatten)]
    pub chunk: Chunk,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_id: i64,
    pub vector: Vec<f32>,
}

/// Optional, AND-combined predicates pushed down to the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryFilters {
    pub document_id: Option<i64>,
    pub min_chars: usize,
    pub exclude_section_exact: Vec<String>,
}

/// Raw nearest-neighbour row returned by a [`crate::VectorIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborRow {
    pub chunk_id: i64,
    pub document_id: i64,
    pub document_title: Option<String>,
    pub source_url: Option<String>,
    pub section_path: Option<String>,
    pub level: u32,
    pub chunk_index: u32,
    pub start_page: u32,
    pub end_page: u32,
    pub content: String,
    pub distance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchCandidate {
    pub chunk_id: i64,
    pub document_id: i64,
    pub document_title: Option<String>,
    pub source_url: Option<String>,
    pub section_path: Option<String>,
    pub chunk_index: u32,
    pub start_page: u32,
    pub end_page: u32,
    pub content: String,
    pub distance: f64,
    pub lexical_hit: u8,
    pub combined_score: f64,
}

fn default_top_k() -> usize {
    5
}

fn default_min_chars() -> usize {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchRequest {
    pub text: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub document_id: Option<i64>,
    #[serde(default)]
    pub exclude_section_exact: Vec<String>,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default)]
    pub clean_preview: bool,
    #[serde(default = "default_true")]
    pub highlight_terms: bool,
}

impl SearchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: default_top_k(),
            offset: 0,
            document_id: None,
            exclude_section_exact: Vec::new(),
            min_chars: default_min_chars(),
            clean_preview: false,
            highlight_terms: true,
        }
    }

    pub fn filters(&self) -> QueryFilters {
        QueryFilters {
            document_id: self.document_id,
            min_chars: self.min_chars,
            exclude_section_exact: self.exclude_section_exact.clone(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub chunk_id: i64,
    /// Older servers send this as `dist`.
    #[serde(alias = "dist")]
    pub distance: f64,
    pub score: f64,
    pub document_id: i64,
    pub document_title: Option<String>,
    pub source_url: Option<String>,
    pub page_url: Option<String>,
    pub section_path: Option<String>,
    pub chunk_index: u32,
    pub start_page: u32,
    pub end_page: u32,
    pub preview: String,
    #[serde(default)]
    pub preview_clean: Option<String>,
    #[serde(default)]
    pub preview_marked: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub query: String,
    pub top_k: usize,
    pub offset: usize,
    pub next_offset: Option<usize>,
    pub document_filter: Option<i64>,
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone)]
pub struct ChunkingOptions {
    pub max_chars: usize,
    pub section_separator: String,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            max_chars: 2_000,
            section_separator: " > ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EmbeddingOptions {
    pub batch_size: usize,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self { batch_size: 32 }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Subtracted from the distance of lexical hits; small enough to only break near-ties.
    pub boost_coefficient: f64,
    pub max_top_k: usize,
    pub preview_chars: usize,
    /// Upper bound on neighbours pulled from the index before ranking; `None` pulls all.
    pub candidate_window: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            boost_coefficient: 0.05,
            max_top_k: 50,
            preview_chars: 300,
            candidate_window: None,
        }
    }
}
