//! In-memory backend used by tests and one-shot runs.
//!
//! All state lives behind a single async `RwLock`, so chunk replacement and
//! embedding batches are applied under one write guard and are atomic with
//! respect to readers. Nearest-neighbour search is brute-force L2.

use crate::error::StoreError;
use crate::models::{
    Chunk, Document, EmbeddingRecord, HeadingEntry, NeighborRow, NewDocument, PageText,
    QueryFilters, StoredChunk, EMBEDDING_DIMENSIONS,
};
use crate::traits::{ChunkStore, DocumentStore, StoreStats, VectorIndex};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    next_document_id: i64,
    next_chunk_id: i64,
    documents: BTreeMap<i64, Document>,
    pages: BTreeMap<(i64, u32), String>,
    toc: HashMap<i64, Vec<HeadingEntry>>,
    chunks: BTreeMap<i64, Chunk>,
    embeddings: HashMap<i64, Vec<f32>>,
}

pub struct MemoryStore {
    dimensions: usize,
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMENSIONS)
    }
}

pub(crate) fn l2_distance(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right.iter())
        .map(|(a, b)| {
            let delta = f64::from(*a) - f64::from(*b);
            delta * delta
        })
        .sum::<f64>()
        .sqrt()
}

fn matches_filters(chunk: &Chunk, filters: &QueryFilters) -> bool {
    if filters
        .document_id
        .is_some_and(|document_id| document_id != chunk.document_id)
    {
        return false;
    }
    if chunk.content.chars().count() < filters.min_chars {
        return false;
    }
    !filters
        .exclude_section_exact
        .iter()
        .any(|excluded| *excluded == chunk.section_path)
}

fn missing_document(document_id: i64) -> StoreError {
    StoreError::NotFound(format!("document {document_id}"))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn register_document(&self, document: &NewDocument) -> Result<Document, StoreError> {
        let mut state = self.state.write().await;
        state.next_document_id += 1;
        let stored = Document {
            id: state.next_document_id,
            title: document.title.clone(),
            source_url: document.source_url.clone(),
            local_path: document.local_path.clone(),
            page_count: None,
            registered_at: Utc::now(),
        };
        state.documents.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_document(&self, document_id: i64) -> Result<Option<Document>, StoreError> {
        Ok(self.state.read().await.documents.get(&document_id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self.state.read().await.documents.values().cloned().collect())
    }

    async fn set_local_path(&self, document_id: i64, local_path: &str) -> Result<Document, StoreError> {
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| missing_document(document_id))?;
        document.local_path = Some(local_path.to_string());
        Ok(document.clone())
    }

    async fn set_page_count(&self, document_id: i64, page_count: u32) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| missing_document(document_id))?;
        document.page_count = Some(page_count);
        Ok(())
    }

    async fn upsert_pages(&self, pages: &[PageText]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for page in pages {
            state
                .pages
                .insert((page.document_id, page.page_number), page.content.clone());
        }
        Ok(())
    }

    async fn page_texts(&self, document_id: i64) -> Result<BTreeMap<u32, String>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .pages
            .range((document_id, 0)..=(document_id, u32::MAX))
            .map(|((_, page_number), content)| (*page_number, content.clone()))
            .collect())
    }

    async fn replace_toc(&self, document_id: i64, entries: &[HeadingEntry]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.documents.contains_key(&document_id) {
            return Err(missing_document(document_id));
        }
        state.toc.insert(document_id, entries.to_vec());
        Ok(())
    }

    async fn toc_entries(&self, document_id: i64) -> Result<Vec<HeadingEntry>, StoreError> {
        let state = self.state.read().await;
        let mut entries = state.toc.get(&document_id).cloned().unwrap_or_default();
        entries.sort_by_key(|entry| entry.order_index);
        Ok(entries)
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn replace_chunks(&self, document_id: i64, chunks: &[Chunk]) -> Result<usize, StoreError> {
        if let Some(foreign) = chunks.iter().find(|chunk| chunk.document_id != document_id) {
            return Err(StoreError::Invalid(format!(
                "chunk for document {} in replacement of document {document_id}",
                foreign.document_id
            )));
        }

        let mut state = self.state.write().await;
        if !state.documents.contains_key(&document_id) {
            return Err(missing_document(document_id));
        }

        let stale: Vec<i64> = state
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.document_id == document_id)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            state.chunks.remove(&id);
            state.embeddings.remove(&id);
        }

        for chunk in chunks {
            state.next_chunk_id += 1;
            let id = state.next_chunk_id;
            state.chunks.insert(id, chunk.clone());
        }

        Ok(chunks.len())
    }

    async fn chunks_for_document(&self, document_id: i64) -> Result<Vec<StoredChunk>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.document_id == document_id)
            .map(|(id, chunk)| StoredChunk {
                id: *id,
                chunk: chunk.clone(),
            })
            .collect())
    }

    async fn get_chunk(&self, chunk_id: i64) -> Result<Option<StoredChunk>, StoreError> {
        let state = self.state.read().await;
        Ok(state.chunks.get(&chunk_id).map(|chunk| StoredChunk {
            id: chunk_id,
            chunk: chunk.clone(),
        }))
    }
}

#[async_trait]
impl VectorIndex for MemoryStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn upsert_embeddings(
        &self,
        records: &[EmbeddingRecord],
        _model: &str,
    ) -> Result<(), StoreError> {
        if let Some(record) = records
            .iter()
            .find(|record| record.vector.len() != self.dimensions)
        {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: record.vector.len(),
            });
        }

        let mut state = self.state.write().await;
        if let Some(record) = records
            .iter()
            .find(|record| !state.chunks.contains_key(&record.chunk_id))
        {
            return Err(StoreError::NotFound(format!("chunk {}", record.chunk_id)));
        }

        for record in records {
            state.embeddings.insert(record.chunk_id, record.vector.clone());
        }
        Ok(())
    }

    async fn nearest_chunks(
        &self,
        query_vector: &[f32],
        filters: &QueryFilters,
        limit: Option<usize>,
    ) -> Result<Vec<NeighborRow>, StoreError> {
        if query_vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: query_vector.len(),
            });
        }

        let state = self.state.read().await;
        let mut rows = state
            .embeddings
            .iter()
            .filter_map(|(chunk_id, vector)| {
                let chunk = state.chunks.get(chunk_id)?;
                if !matches_filters(chunk, filters) {
                    return None;
                }
                let document = state.documents.get(&chunk.document_id);
                Some(NeighborRow {
                    chunk_id: *chunk_id,
                    document_id: chunk.document_id,
                    document_title: document.map(|doc| doc.title.clone()),
                    source_url: document.map(|doc| doc.source_url.clone()),
                    section_path: Some(chunk.section_path.clone()),
                    level: chunk.level,
                    chunk_index: chunk.chunk_index,
                    start_page: chunk.start_page,
                    end_page: chunk.end_page,
                    content: chunk.content.clone(),
                    distance: l2_distance(vector, query_vector),
                })
            })
            .collect::<Vec<_>>();

        rows.sort_by(|left, right| {
            left.distance
                .total_cmp(&right.distance)
                .then(left.chunk_id.cmp(&right.chunk_id))
        });
        if let Some(limit) = limit {
            rows.truncate(limit);
        }

        Ok(rows)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.read().await;
        Ok(StoreStats {
            documents: state.documents.len() as u64,
            chunks: state.chunks.len() as u64,
            embeddings: state.embeddings.len() as u64,
        })
    }
}
