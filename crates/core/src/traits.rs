use crate::error::StoreError;
use crate::models::{
    Chunk, Document, EmbeddingRecord, HeadingEntry, NeighborRow, NewDocument, PageText,
    QueryFilters, StoredChunk,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn register_document(&self, document: &NewDocument) -> Result<Document, StoreError>;

    async fn get_document(&self, document_id: i64) -> Result<Option<Document>, StoreError>;

    async fn list_documents(&self) -> Result<Vec<Document>, StoreError>;

    async fn set_local_path(&self, document_id: i64, local_path: &str) -> Result<Document, StoreError>;

    async fn set_page_count(&self, document_id: i64, page_count: u32) -> Result<(), StoreError>;

    /// Upserts pages keyed by `(document_id, page_number)` as one batch.
    async fn upsert_pages(&self, pages: &[PageText]) -> Result<(), StoreError>;

    async fn page_texts(&self, document_id: i64) -> Result<BTreeMap<u32, String>, StoreError>;

    /// Replaces the stored outline of a document as one batch.
    async fn replace_toc(&self, document_id: i64, entries: &[HeadingEntry]) -> Result<(), StoreError>;

    /// Stored outline ordered by `order_index`.
    async fn toc_entries(&self, document_id: i64) -> Result<Vec<HeadingEntry>, StoreError>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Deletes every chunk of the document and inserts `chunks`, atomically.
    /// Readers observe either the old set or the new one, never a mix.
    async fn replace_chunks(&self, document_id: i64, chunks: &[Chunk]) -> Result<usize, StoreError>;

    /// Chunks of a document ordered by id.
    async fn chunks_for_document(&self, document_id: i64) -> Result<Vec<StoredChunk>, StoreError>;

    async fn get_chunk(&self, chunk_id: i64) -> Result<Option<StoredChunk>, StoreError>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Upserts one batch of embeddings and commits it. A vector of the wrong
    /// width rejects the whole batch before anything is written.
    async fn upsert_embeddings(
        &self,
        records: &[EmbeddingRecord],
        model: &str,
    ) -> Result<(), StoreError>;

    /// Embedded chunks matching `filters`, with their L2 distance to
    /// `query_vector`, ascending by distance then chunk id. `limit: None`
    /// returns every match.
    async fn nearest_chunks(
        &self,
        query_vector: &[f32],
        filters: &QueryFilters,
        limit: Option<usize>,
    ) -> Result<Vec<NeighborRow>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub documents: u64,
    pub chunks: u64,
    pub embeddings: u64,
}

/// Everything the ingestion pipeline needs from a backend.
pub trait ManualStore: DocumentStore + ChunkStore + VectorIndex {}

impl<T> ManualStore for T where T: DocumentStore + ChunkStore + VectorIndex {}
