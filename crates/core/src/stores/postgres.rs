use crate::error::StoreError;
use crate::models::{
    Chunk, Document, EmbeddingRecord, HeadingEntry, NeighborRow, NewDocument, PageText,
    QueryFilters, StoredChunk,
};
use crate::traits::{ChunkStore, DocumentStore, StoreStats, VectorIndex};
use async_trait::async_trait;
use pgvector::Vector;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

const DOCUMENT_COLUMNS: &str = "id, title, source_url, local_path, page_count, registered_at";

const CHUNK_COLUMNS: &str =
    "id, document_id, section_path, level, start_page, end_page, chunk_index, content";

/// Postgres backend using the pgvector `<->` (L2) operator.
///
/// Plain statements share the client and are pipelined over one connection;
/// only transactions take the exclusive side of the lock.
pub struct PgVectorStore {
    client: RwLock<Client>,
    dimensions: usize,
}

impl PgVectorStore {
    pub async fn connect(database_url: &str, dimensions: usize) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });

        Ok(Self {
            client: RwLock::new(client),
            dimensions,
        })
    }

    /// Creates the extension and tables when missing. Existing tables are left untouched.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let ddl = format!(
            "CREATE EXTENSION IF NOT EXISTS vector;
            CREATE TABLE IF NOT EXISTS documents (
                id BIGSERIAL PRIMARY KEY,
                title TEXT NOT NULL,
                source_url TEXT NOT NULL,
                local_path TEXT,
                page_count INTEGER,
                registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS document_pages (
                document_id BIGINT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                page_number INTEGER NOT NULL,
                content TEXT NOT NULL,
                PRIMARY KEY (document_id, page_number)
            );
            CREATE TABLE IF NOT EXISTS document_toc (
                document_id BIGINT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                level INTEGER NOT NULL,
                title TEXT NOT NULL,
                page_from INTEGER NOT NULL,
                order_index BIGINT NOT NULL,
                PRIMARY KEY (document_id, order_index)
            );
            CREATE TABLE IF NOT EXISTS document_chunks (
                id BIGSERIAL PRIMARY KEY,
                document_id BIGINT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                section_path TEXT,
                level INTEGER NOT NULL,
                start_page INTEGER NOT NULL,
                end_page INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                UNIQUE (document_id, section_path, chunk_index)
            );
            CREATE TABLE IF NOT EXISTS chunk_embeddings (
                chunk_id BIGINT PRIMARY KEY REFERENCES document_chunks(id) ON DELETE CASCADE,
                embedding VECTOR({dims}) NOT NULL,
                model TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );",
            dims = self.dimensions
        );

        self.client.read().await.batch_execute(&ddl).await?;
        Ok(())
    }
}

fn to_db_int(value: u32, field: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Invalid(format!("{field} {value} exceeds INTEGER")))
}

fn from_db_int(value: i32, field: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Invalid(format!("{field} {value} is negative")))
}

fn document_from_row(row: &Row) -> Result<Document, StoreError> {
    let page_count: Option<i32> = row.try_get("page_count")?;
    Ok(Document {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        source_url: row.try_get("source_url")?,
        local_path: row.try_get("local_path")?,
        page_count: page_count
            .map(|count| from_db_int(count, "page_count"))
            .transpose()?,
        registered_at: row.try_get("registered_at")?,
    })
}

fn chunk_from_row(row: &Row) -> Result<StoredChunk, StoreError> {
    let section_path: Option<String> = row.try_get("section_path")?;
    Ok(StoredChunk {
        id: row.try_get("id")?,
        chunk: Chunk {
            document_id: row.try_get("document_id")?,
            section_path: section_path.unwrap_or_default(),
            level: from_db_int(row.try_get("level")?, "level")?,
            start_page: from_db_int(row.try_get("start_page")?, "start_page")?,
            end_page: from_db_int(row.try_get("end_page")?, "end_page")?,
            chunk_index: from_db_int(row.try_get("chunk_index")?, "chunk_index")?,
            content: row.try_get("content")?,
        },
    })
}

#[async_trait]
impl DocumentStore for PgVectorStore {
    async fn register_document(&self, document: &NewDocument) -> Result<Document, StoreError> {
        let sql = format!(
            "INSERT INTO documents (title, source_url, local_path) VALUES ($1, $2, $3) \
             RETURNING {DOCUMENT_COLUMNS}"
        );
        let client = self.client.read().await;
        let row = client
            .query_one(
                &sql,
                &[&document.title, &document.source_url, &document.local_path],
            )
            .await?;
        document_from_row(&row)
    }

    async fn get_document(&self, document_id: i64) -> Result<Option<Document>, StoreError> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1");
        let client = self.client.read().await;
        client
            .query_opt(&sql, &[&document_id])
            .await?
            .as_ref()
            .map(document_from_row)
            .transpose()
    }

    async fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY id ASC");
        let client = self.client.read().await;
        client
            .query(&sql, &[])
            .await?
            .iter()
            .map(document_from_row)
            .collect()
    }

    async fn set_local_path(&self, document_id: i64, local_path: &str) -> Result<Document, StoreError> {
        let sql = format!(
            "UPDATE documents SET local_path = $1 WHERE id = $2 RETURNING {DOCUMENT_COLUMNS}"
        );
        let client = self.client.read().await;
        let row = client
            .query_opt(&sql, &[&local_path, &document_id])
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("document {document_id}")))?;
        document_from_row(&row)
    }

    async fn set_page_count(&self, document_id: i64, page_count: u32) -> Result<(), StoreError> {
        let page_count = to_db_int(page_count, "page_count")?;
        let client = self.client.read().await;
        let updated = client
            .execute(
                "UPDATE documents SET page_count = $1 WHERE id = $2",
                &[&page_count, &document_id],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("document {document_id}")));
        }
        Ok(())
    }

    async fn upsert_pages(&self, pages: &[PageText]) -> Result<(), StoreError> {
        if pages.is_empty() {
            return Ok(());
        }

        let mut client = self.client.write().await;
        let transaction = client.transaction().await?;
        let statement = transaction
            .prepare(
                "INSERT INTO document_pages (document_id, page_number, content) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (document_id, page_number) DO UPDATE SET content = EXCLUDED.content",
            )
            .await?;
        for page in pages {
            let page_number = to_db_int(page.page_number, "page_number")?;
            transaction
                .execute(&statement, &[&page.document_id, &page_number, &page.content])
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn page_texts(&self, document_id: i64) -> Result<BTreeMap<u32, String>, StoreError> {
        let client = self.client.read().await;
        let rows = client
            .query(
                "SELECT page_number, content FROM document_pages WHERE document_id = $1",
                &[&document_id],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let page_number = from_db_int(row.try_get("page_number")?, "page_number")?;
                Ok((page_number, row.try_get("content")?))
            })
            .collect()
    }

    async fn replace_toc(&self, document_id: i64, entries: &[HeadingEntry]) -> Result<(), StoreError> {
        let mut client = self.client.write().await;
        let transaction = client.transaction().await?;
        transaction
            .execute(
                "DELETE FROM document_toc WHERE document_id = $1",
                &[&document_id],
            )
            .await?;
        let statement = transaction
            .prepare(
                "INSERT INTO document_toc (document_id, level, title, page_from, order_index) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .await?;
        for entry in entries {
            let level = to_db_int(entry.level, "level")?;
            let page_from = to_db_int(entry.start_page, "start_page")?;
            transaction
                .execute(
                    &statement,
                    &[&document_id, &level, &entry.title, &page_from, &entry.order_index],
                )
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn toc_entries(&self, document_id: i64) -> Result<Vec<HeadingEntry>, StoreError> {
        let client = self.client.read().await;
        let rows = client
            .query(
                "SELECT level, title, page_from, order_index FROM document_toc \
                 WHERE document_id = $1 ORDER BY order_index ASC",
                &[&document_id],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let title: String = row.try_get("title")?;
                Ok(HeadingEntry::new(
                    from_db_int(row.try_get("level")?, "level")?,
                    title,
                    from_db_int(row.try_get("page_from")?, "page_from")?,
                    row.try_get("order_index")?,
                ))
            })
            .collect()
    }
}

#[async_trait]
impl ChunkStore for PgVectorStore {
    async fn replace_chunks(&self, document_id: i64, chunks: &[Chunk]) -> Result<usize, StoreError> {
        let mut client = self.client.write().await;
        let transaction = client.transaction().await?;

        let removed = transaction
            .execute(
                "DELETE FROM document_chunks WHERE document_id = $1",
                &[&document_id],
            )
            .await?;
        debug!(document_id, removed, "cleared previous chunks");

        let statement = transaction
            .prepare(
                "INSERT INTO document_chunks \
                 (document_id, section_path, level, start_page, end_page, chunk_index, content) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .await?;
        for chunk in chunks {
            if chunk.document_id != document_id {
                return Err(StoreError::Invalid(format!(
                    "chunk for document {} in replacement of document {document_id}",
                    chunk.document_id
                )));
            }
            let level = to_db_int(chunk.level, "level")?;
            let start_page = to_db_int(chunk.start_page, "start_page")?;
            let end_page = to_db_int(chunk.end_page, "end_page")?;
            let chunk_index = to_db_int(chunk.chunk_index, "chunk_index")?;
            transaction
                .execute(
                    &statement,
                    &[
                        &document_id,
                        &chunk.section_path,
                        &level,
                        &start_page,
                        &end_page,
                        &chunk_index,
                        &chunk.content,
                    ],
                )
                .await?;
        }

        transaction.commit().await?;
        Ok(chunks.len())
    }

    async fn chunks_for_document(&self, document_id: i64) -> Result<Vec<StoredChunk>, StoreError> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM document_chunks WHERE document_id = $1 ORDER BY id ASC"
        );
        let client = self.client.read().await;
        client
            .query(&sql, &[&document_id])
            .await?
            .iter()
            .map(chunk_from_row)
            .collect()
    }

    async fn get_chunk(&self, chunk_id: i64) -> Result<Option<StoredChunk>, StoreError> {
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM document_chunks WHERE id = $1");
        let client = self.client.read().await;
        client
            .query_opt(&sql, &[&chunk_id])
            .await?
            .as_ref()
            .map(chunk_from_row)
            .transpose()
    }
}

#[async_trait]
impl VectorIndex for PgVectorStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn upsert_embeddings(
        &self,
        records: &[EmbeddingRecord],
        model: &str,
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
        if records.is_empty() {
            return Ok(());
        }

        let mut client = self.client.write().await;
        let transaction = client.transaction().await?;
        let statement = transaction
            .prepare(
                "INSERT INTO chunk_embeddings (chunk_id, embedding, model) VALUES ($1, $2, $3) \
                 ON CONFLICT (chunk_id) DO UPDATE SET \
                     embedding = EXCLUDED.embedding, \
                     model = EXCLUDED.model, \
                     created_at = NOW()",
            )
            .await?;
        for record in records {
            let vector = Vector::from(record.vector.clone());
            transaction
                .execute(&statement, &[&record.chunk_id, &vector, &model])
                .await?;
        }
        transaction.commit().await?;
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

        let vector = Vector::from(query_vector.to_vec());
        let min_chars = i32::try_from(filters.min_chars).unwrap_or(i32::MAX);
        let limit = limit
            .map(|value| {
                i64::try_from(value)
                    .map_err(|_| StoreError::Invalid(format!("limit {value} exceeds BIGINT")))
            })
            .transpose()?;

        // Optional filters are nullable parameters of one statement; NULL LIMIT means no limit.
        let sql = "SELECT c.id, c.document_id, d.title AS document_title, d.source_url, \
                    c.section_path, c.level, c.chunk_index, c.start_page, c.end_page, c.content, \
                    (ce.embedding <-> $1) AS distance \
             FROM chunk_embeddings ce \
             JOIN document_chunks c ON c.id = ce.chunk_id \
             LEFT JOIN documents d ON d.id = c.document_id \
             WHERE ($2::BIGINT IS NULL OR c.document_id = $2) \
               AND char_length(c.content) >= $3 \
               AND NOT (COALESCE(c.section_path, '') = ANY($4)) \
             ORDER BY distance ASC, c.id ASC \
             LIMIT $5";

        let client = self.client.read().await;
        let rows = client
            .query(
                sql,
                &[
                    &vector,
                    &filters.document_id,
                    &min_chars,
                    &filters.exclude_section_exact,
                    &limit,
                ],
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(NeighborRow {
                    chunk_id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    document_title: row.try_get("document_title")?,
                    source_url: row.try_get("source_url")?,
                    section_path: row.try_get("section_path")?,
                    level: from_db_int(row.try_get("level")?, "level")?,
                    chunk_index: from_db_int(row.try_get("chunk_index")?, "chunk_index")?,
                    start_page: from_db_int(row.try_get("start_page")?, "start_page")?,
                    end_page: from_db_int(row.try_get("end_page")?, "end_page")?,
                    content: row.try_get("content")?,
                    distance: row.try_get("distance")?,
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let client = self.client.read().await;
        let row = client
            .query_one(
                "SELECT \
                    (SELECT COUNT(*) FROM documents) AS documents, \
                    (SELECT COUNT(*) FROM document_chunks) AS chunks, \
                    (SELECT COUNT(*) FROM chunk_embeddings) AS embeddings",
                &[],
            )
            .await?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row.try_get(column)?;
            u64::try_from(value).map_err(|_| StoreError::Invalid(format!("{column} count {value}")))
        };

        Ok(StoreStats {
            documents: count("documents")?,
            chunks: count("chunks")?,
            embeddings: count("embeddings")?,
        })
    }
}
