use crate::chunking::build_chunks;
use crate::embeddings::{check_dimensions, Embedder};
use crate::error::{EmbeddingError, IngestError};
use crate::export::safe_file_name;
use crate::extractor::PdfExtractor;
use crate::models::{
    ChunkingOptions, Document, EmbeddingOptions, EmbeddingRecord, HeadingEntry, NewDocument,
    PageText,
};
use crate::normalize::normalize_text;
use crate::toc::resolve_ranges;
use crate::traits::ManualStore;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use url::Url;
use walkdir::WalkDir;

const PREVIEW_CHARS: usize = 300;
const SAMPLE_SIZE: usize = 3;
const DOWNLOAD_USER_AGENT: &str = concat!("manual-search/", env!("CARGO_PKG_VERSION"));

pub const NOTE_NO_OUTLINE: &str = "No TOC found in PDF.";
pub const NOTE_NO_STORED_TOC: &str = "No stored TOC found. Run store-toc first.";
pub const NOTE_NO_SECTION_TEXT: &str = "No text found for TOC ranges. Ensure parse-pages ran.";

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// First `PREVIEW_CHARS` characters, with an ellipsis when cut.
fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head = chars.by_ref().take(PREVIEW_CHARS).collect::<String>();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PagePreview {
    pub page_number: u32,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsePagesReport {
    pub document_id: i64,
    pub title: String,
    pub pages_total: usize,
    pub pages_empty: usize,
    pub previews: Vec<PagePreview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreTocReport {
    pub document_id: i64,
    pub stored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSample {
    pub section_path: String,
    pub level: u32,
    pub range: String,
    pub chunk_index: u32,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReport {
    pub document_id: i64,
    pub title: String,
    pub sections_seen: usize,
    pub chunks_created: usize,
    pub sample: Vec<ChunkSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedReport {
    pub document_id: i64,
    pub provider: String,
    pub dim: usize,
    pub total_chunks: usize,
    pub embedded: usize,
    pub skipped: usize,
    pub batches: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedChunkReport {
    pub chunk_id: i64,
    pub provider: String,
    pub dim: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentIngestReport {
    pub document: Document,
    pub pages: ParsePagesReport,
    pub toc: StoreTocReport,
    pub chunks: ChunkReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<EmbedReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub document: Document,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderIngestReport {
    pub documents: Vec<DocumentIngestReport>,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Drives documents from a PDF on disk to embedded, searchable chunks.
/// Every stage reads its inputs back from the store, so stages can be re-run
/// independently.
pub struct IngestPipeline<S: ManualStore + ?Sized> {
    store: Arc<S>,
    extractor: Arc<dyn PdfExtractor>,
    embedder: Arc<dyn Embedder>,
    http: Client,
    chunking: ChunkingOptions,
    embedding: EmbeddingOptions,
}

impl<S: ManualStore + ?Sized> IngestPipeline<S> {
    pub fn new(
        store: Arc<S>,
        extractor: Arc<dyn PdfExtractor>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            extractor,
            embedder,
            http: Client::new(),
            chunking: ChunkingOptions::default(),
            embedding: EmbeddingOptions::default(),
        }
    }

    pub fn with_chunking(mut self, chunking: ChunkingOptions) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_embedding(mut self, embedding: EmbeddingOptions) -> Self {
        self.embedding = embedding;
        self
    }

    /// Client used to fetch `http(s)` source URLs.
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn document(&self, document_id: i64) -> Result<Document, IngestError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("document {document_id}")))
    }

    fn pdf_path(document: &Document) -> Result<PathBuf, IngestError> {
        let local_path = document
            .local_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .ok_or_else(|| {
                IngestError::InvalidArgument(format!(
                    "document {} has no local_path; set it first",
                    document.id
                ))
            })?;

        let path = PathBuf::from(local_path);
        if !path.exists() {
            return Err(IngestError::InvalidArgument(format!(
                "local_path not found: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    pub async fn register_document(&self, document: NewDocument) -> Result<Document, IngestError> {
        let title = document.title.trim();
        if title.is_empty() {
            return Err(IngestError::InvalidArgument("title is empty".to_string()));
        }
        if document.source_url.trim().is_empty() {
            return Err(IngestError::InvalidArgument("source_url is empty".to_string()));
        }

        let registered = self
            .store
            .register_document(&NewDocument {
                title: title.to_string(),
                source_url: document.source_url.trim().to_string(),
                local_path: document.local_path,
            })
            .await?;
        info!(document_id = registered.id, title = %registered.title, "registered document");
        Ok(registered)
    }

    /// Registers every PDF under `folder` (recursively, sorted by path) with
    /// its file stem as title and a `file://` source URL.
    pub async fn register_folder(&self, folder: &Path) -> Result<Vec<Document>, IngestError> {
        if !folder.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "{} is not a directory",
                folder.display()
            )));
        }

        let files = discover_pdf_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }

        let mut documents = Vec::with_capacity(files.len());
        for path in files {
            let absolute = std::fs::canonicalize(&path)?;
            let source_url = Url::from_file_path(&absolute).map_err(|()| {
                IngestError::InvalidArgument(format!(
                    "cannot build a file url for {}",
                    absolute.display()
                ))
            })?;
            let title = absolute
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("untitled")
                .to_string();

            documents.push(
                self.register_document(NewDocument {
                    title,
                    source_url: source_url.to_string(),
                    local_path: Some(absolute.to_string_lossy().to_string()),
                })
                .await?,
            );
        }
        Ok(documents)
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>, IngestError> {
        Ok(self.store.list_documents().await?)
    }

    pub async fn get_document(&self, document_id: i64) -> Result<Document, IngestError> {
        self.document(document_id).await
    }

    pub async fn set_local_path(
        &self,
        document_id: i64,
        local_path: &Path,
    ) -> Result<Document, IngestError> {
        if !local_path.exists() {
            return Err(IngestError::InvalidArgument(format!(
                "local_path does not exist on disk: {}",
                local_path.display()
            )));
        }
        Ok(self
            .store
            .set_local_path(document_id, &local_path.to_string_lossy())
            .await?)
    }

    async fn fetch_source(&self, source: &Url) -> Result<Vec<u8>, IngestError> {
        match source.scheme() {
            "file" => {
                let path = source.to_file_path().map_err(|()| {
                    IngestError::InvalidArgument(format!("not a local file url: {source}"))
                })?;
                Ok(tokio::fs::read(&path).await?)
            }
            "http" | "https" => {
                let response = self
                    .http
                    .get(source.clone())
                    .header(USER_AGENT, DOWNLOAD_USER_AGENT)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(IngestError::Download(format!("{source} returned {status}")));
                }
                Ok(response.bytes().await?.to_vec())
            }
            other => Err(IngestError::InvalidArgument(format!(
                "unsupported source url scheme {other:?}"
            ))),
        }
    }

    /// Fetches the document's `source_url` into `docs_dir` as
    /// `<safe title>.pdf` and points `local_path` at the saved file.
    pub async fn download_document(
        &self,
        document_id: i64,
        docs_dir: &Path,
    ) -> Result<DownloadReport, IngestError> {
        let document = self.document(document_id).await?;
        let source = Url::parse(document.source_url.trim()).map_err(|error| {
            IngestError::InvalidArgument(format!(
                "source_url of document {document_id} is not a url: {error}"
            ))
        })?;

        let span = info_span!("download-document", document_id, source = %source);
        async {
            let started = Instant::now();
            let title = document.title.trim();
            let mut file_name = if title.is_empty() {
                format!("doc_{document_id}")
            } else {
                safe_file_name(title)
            };
            if !file_name.to_ascii_lowercase().ends_with(".pdf") {
                file_name.push_str(".pdf");
            }

            let bytes = self.fetch_source(&source).await?;

            tokio::fs::create_dir_all(docs_dir).await?;
            let target = tokio::fs::canonicalize(docs_dir).await?.join(file_name);
            tokio::fs::write(&target, &bytes).await?;

            let updated = self
                .store
                .set_local_path(document_id, &target.to_string_lossy())
                .await?;
            info!(
                path = %target.display(),
                bytes = bytes.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "downloaded document"
            );
            Ok::<_, IngestError>(DownloadReport {
                document: updated,
                bytes: bytes.len(),
            })
        }
        .instrument(span)
        .await
    }

    pub async fn parse_pages(&self, document_id: i64) -> Result<ParsePagesReport, IngestError> {
        let document = self.document(document_id).await?;
        let path = Self::pdf_path(&document)?;

        let span = info_span!("parse-pages", document_id);
        async {
            let started = Instant::now();
            let raw_pages = self.extractor.extract_pages(&path)?;

            let records = raw_pages
                .into_iter()
                .map(|page| PageText {
                    document_id,
                    page_number: page.number,
                    content: normalize_text(&page.text.replace('\0', "")),
                })
                .collect::<Vec<_>>();
            let pages_empty = records
                .iter()
                .filter(|page| page.content.trim().is_empty())
                .count();

            self.store.upsert_pages(&records).await?;
            let page_count = u32::try_from(records.len()).map_err(|_| {
                IngestError::InvalidArgument(format!("too many pages: {}", records.len()))
            })?;
            self.store.set_page_count(document_id, page_count).await?;

            info!(
                pages = records.len(),
                pages_empty,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "parsed pages"
            );

            Ok::<_, IngestError>(ParsePagesReport {
                document_id,
                title: document.title.clone(),
                pages_total: records.len(),
                pages_empty,
                previews: records
                    .iter()
                    .take(SAMPLE_SIZE)
                    .map(|page| PagePreview {
                        page_number: page.page_number,
                        preview: preview(&page.content),
                    })
                    .collect(),
            })
        }
        .instrument(span)
        .await
    }

    /// The outline as read from the PDF, without storing it.
    pub async fn pdf_toc(&self, document_id: i64) -> Result<Vec<HeadingEntry>, IngestError> {
        let document = self.document(document_id).await?;
        let path = Self::pdf_path(&document)?;
        self.extractor.extract_toc(&path)
    }

    pub async fn store_toc(&self, document_id: i64) -> Result<StoreTocReport, IngestError> {
        let document = self.document(document_id).await?;
        let path = Self::pdf_path(&document)?;

        let span = info_span!("store-toc", document_id);
        async {
            let started = Instant::now();
            let entries = self.extractor.extract_toc(&path)?;
            if entries.is_empty() {
                info!("pdf has no outline");
                return Ok(StoreTocReport {
                    document_id,
                    stored: 0,
                    note: Some(NOTE_NO_OUTLINE.to_string()),
                });
            }

            self.store.replace_toc(document_id, &entries).await?;
            info!(
                stored = entries.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stored toc"
            );
            Ok::<_, IngestError>(StoreTocReport {
                document_id,
                stored: entries.len(),
                note: None,
            })
        }
        .instrument(span)
        .await
    }

    /// The stored outline, ordered by `order_index`.
    pub async fn toc(&self, document_id: i64) -> Result<Vec<HeadingEntry>, IngestError> {
        self.document(document_id).await?;
        Ok(self.store.toc_entries(document_id).await?)
    }

    pub async fn chunk_document(&self, document_id: i64) -> Result<ChunkReport, IngestError> {
        let document = self.document(document_id).await?;

        let span = info_span!("chunk-toc", document_id);
        async {
            let started = Instant::now();
            let empty_report = |sections_seen: usize, note: &str| ChunkReport {
                document_id,
                title: document.title.clone(),
                sections_seen,
                chunks_created: 0,
                sample: Vec::new(),
                note: Some(note.to_string()),
            };

            let entries = self.store.toc_entries(document_id).await?;
            if entries.is_empty() {
                info!("no stored toc");
                return Ok(empty_report(0, NOTE_NO_STORED_TOC));
            }

            let pages = self.store.page_texts(document_id).await?;
            let page_count = document
                .page_count
                .or_else(|| pages.keys().next_back().copied())
                .unwrap_or(0);

            let layout = resolve_ranges(&entries, page_count, &self.chunking.section_separator);
            let chunks = build_chunks(document_id, &layout, &pages, &self.chunking);
            if chunks.is_empty() {
                warn!(sections = layout.len(), "toc ranges contain no page text");
                return Ok(empty_report(layout.len(), NOTE_NO_SECTION_TEXT));
            }

            let created = self.store.replace_chunks(document_id, &chunks).await?;
            info!(
                sections = layout.len(),
                chunks = created,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "chunked document"
            );

            Ok::<_, IngestError>(ChunkReport {
                document_id,
                title: document.title.clone(),
                sections_seen: layout.len(),
                chunks_created: created,
                sample: chunks
                    .iter()
                    .take(SAMPLE_SIZE)
                    .map(|chunk| ChunkSample {
                        section_path: chunk.section_path.clone(),
                        level: chunk.level,
                        range: format!("{}-{}", chunk.start_page, chunk.end_page),
                        chunk_index: chunk.chunk_index,
                        preview: preview(&chunk.content),
                    })
                    .collect(),
                note: None,
            })
        }
        .instrument(span)
        .await
    }

    /// Embeds `texts` and rejects the result unless it has one vector per text
    /// of the index width.
    async fn embed_checked(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let vectors = self.embedder.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            }
            .into());
        }
        check_dimensions(&vectors, self.store.dimensions())?;
        Ok(vectors)
    }

    /// Embeds every chunk of a document in batches, committing each batch.
    /// A failure leaves earlier batches stored; re-running overwrites them.
    pub async fn embed_document(&self, document_id: i64) -> Result<EmbedReport, IngestError> {
        let span = info_span!("embed-document", document_id, provider = self.embedder.name());
        async {
            let started = Instant::now();
            let chunks = self.store.chunks_for_document(document_id).await?;
            if chunks.is_empty() {
                return Err(IngestError::NotFound(format!(
                    "no chunks for document {document_id}"
                )));
            }

            let mut embedded = 0;
            let mut skipped = 0;
            let mut batches = 0;
            for batch in chunks.chunks(self.embedding.batch_size.max(1)) {
                let (ids, texts): (Vec<i64>, Vec<String>) = batch
                    .iter()
                    .filter(|stored| !stored.chunk.content.trim().is_empty())
                    .map(|stored| (stored.id, stored.chunk.content.clone()))
                    .unzip();
                let skipped_in_batch = batch.len() - ids.len();
                skipped += skipped_in_batch;
                if ids.is_empty() {
                    continue;
                }

                let vectors = self.embed_checked(&texts).await?;
                let records = ids
                    .into_iter()
                    .zip(vectors)
                    .map(|(chunk_id, vector)| EmbeddingRecord { chunk_id, vector })
                    .collect::<Vec<_>>();
                self.store
                    .upsert_embeddings(&records, self.embedder.name())
                    .await?;

                embedded += records.len();
                batches += 1;
                info!(
                    batch = batches,
                    embedded = records.len(),
                    skipped_in_batch,
                    "batch committed"
                );
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(total = chunks.len(), embedded, skipped, elapsed_ms, "embedded document");
            Ok::<_, IngestError>(EmbedReport {
                document_id,
                provider: self.embedder.name().to_string(),
                dim: self.store.dimensions(),
                total_chunks: chunks.len(),
                embedded,
                skipped,
                batches,
                elapsed_ms,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn embed_chunk(&self, chunk_id: i64) -> Result<EmbedChunkReport, IngestError> {
        let started = Instant::now();
        let stored = self
            .store
            .get_chunk(chunk_id)
            .await?
            .filter(|stored| !stored.chunk.content.trim().is_empty())
            .ok_or_else(|| IngestError::NotFound(format!("chunk {chunk_id} or its content")))?;

        let vector = self
            .embed_checked(std::slice::from_ref(&stored.chunk.content))
            .await?
            .remove(0);
        let dim = vector.len();
        self.store
            .upsert_embeddings(&[EmbeddingRecord { chunk_id, vector }], self.embedder.name())
            .await?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(chunk_id, provider = self.embedder.name(), elapsed_ms, "embedded chunk");
        Ok(EmbedChunkReport {
            chunk_id,
            provider: self.embedder.name().to_string(),
            dim,
            elapsed_ms,
        })
    }

    /// Runs every stage for one registered document. Embedding is skipped when
    /// chunking produced nothing.
    pub async fn ingest_document(&self, document_id: i64) -> Result<DocumentIngestReport, IngestError> {
        let pages = self.parse_pages(document_id).await?;
        let toc = self.store_toc(document_id).await?;
        let chunks = self.chunk_document(document_id).await?;
        let embeddings = if chunks.chunks_created > 0 {
            Some(self.embed_document(document_id).await?)
        } else {
            None
        };

        Ok(DocumentIngestReport {
            document: self.document(document_id).await?,
            pages,
            toc,
            chunks,
            embeddings,
        })
    }

    /// Registers and ingests every PDF under `folder`. A document that fails a
    /// stage is recorded as skipped and the run moves on.
    pub async fn ingest_folder(&self, folder: &Path) -> Result<FolderIngestReport, IngestError> {
        let registered = self.register_folder(folder).await?;

        let mut documents = Vec::new();
        let mut skipped_files = Vec::new();
        for document in registered {
            match self.ingest_document(document.id).await {
                Ok(report) => documents.push(report),
                Err(error) => {
                    let path = PathBuf::from(document.local_path.unwrap_or_default());
                    warn!(path = %path.display(), %error, "skipped pdf");
                    skipped_files.push(SkippedPdf {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(FolderIngestReport {
            documents,
            skipped_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::extractor::{LopdfExtractor, RawPage};
    use crate::models::Chunk;
    use crate::stores::MemoryStore;
    use crate::traits::{ChunkStore, DocumentStore, VectorIndex};
    use async_trait::async_trait;
    use std::fs::{self, File};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    const DIMS: usize = 8;

    struct FakeExtractor {
        pages: Vec<RawPage>,
        toc: Vec<HeadingEntry>,
    }

    impl PdfExtractor for FakeExtractor {
        fn extract_pages(&self, _path: &Path) -> Result<Vec<RawPage>, IngestError> {
            Ok(self.pages.clone())
        }

        fn extract_toc(&self, _path: &Path) -> Result<Vec<HeadingEntry>, IngestError> {
            Ok(self.toc.clone())
        }
    }

    fn manual_extractor() -> FakeExtractor {
        let pages = (1..=10)
            .map(|number| RawPage {
                number,
                text: if number == 7 {
                    "   ".to_string()
                } else {
                    format!("Page {number} body\u{0} with   \u{201c}quoted\u{201d} text.")
                },
            })
            .collect();
        let toc = vec![
            HeadingEntry::new(1, "A", 1, 1),
            HeadingEntry::new(2, "A.1", 2, 2),
            HeadingEntry::new(2, "A.2", 5, 3),
            HeadingEntry::new(1, "B", 9, 4),
        ];
        FakeExtractor { pages, toc }
    }

    /// Fails every call after the first `succeed` ones.
    struct FlakyEmbedder {
        inner: HashEmbedder,
        succeed: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.succeed {
                return Err(EmbeddingError::Provider("provider unavailable".to_string()));
            }
            self.inner.embed(texts).await
        }
    }

    fn pipeline_with(
        extractor: FakeExtractor,
        embedder: Arc<dyn Embedder>,
    ) -> IngestPipeline<MemoryStore> {
        IngestPipeline::new(Arc::new(MemoryStore::new(DIMS)), Arc::new(extractor), embedder)
    }

    fn pipeline(extractor: FakeExtractor) -> IngestPipeline<MemoryStore> {
        pipeline_with(extractor, Arc::new(HashEmbedder { dimensions: DIMS }))
    }

    async fn registered_with_file(
        pipeline: &IngestPipeline<MemoryStore>,
    ) -> (TempDir, Document) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manual.pdf");
        fs::write(&path, b"%PDF-1.4\n%fake").unwrap();
        let document = pipeline
            .register_document(NewDocument {
                title: "  Pump Manual ".to_string(),
                source_url: "https://example.com/pump.pdf".to_string(),
                local_path: Some(path.to_string_lossy().to_string()),
            })
            .await
            .unwrap();
        (dir, document)
    }

    #[tokio::test]
    async fn stages_run_end_to_end() {
        let pipeline = pipeline(manual_extractor());
        let (_dir, document) = registered_with_file(&pipeline).await;
        assert_eq!(document.title, "Pump Manual");

        let pages = pipeline.parse_pages(document.id).await.unwrap();
        assert_eq!(pages.pages_total, 10);
        assert_eq!(pages.pages_empty, 1);
        assert_eq!(pages.previews.len(), 3);
        assert_eq!(pages.previews[0].preview, "Page 1 body with \"quoted\" text.");

        let toc = pipeline.store_toc(document.id).await.unwrap();
        assert_eq!(toc.stored, 4);
        assert_eq!(pipeline.toc(document.id).await.unwrap().len(), 4);

        let chunks = pipeline.chunk_document(document.id).await.unwrap();
        assert_eq!(chunks.sections_seen, 4);
        assert_eq!(chunks.chunks_created, 4);
        assert_eq!(chunks.sample[0].range, "1-8");
        assert_eq!(chunks.sample[1].section_path, "A > A.1");
        assert_eq!(chunks.sample[1].range, "2-4");

        let embedded = pipeline.embed_document(document.id).await.unwrap();
        assert_eq!(embedded.total_chunks, 4);
        assert_eq!(embedded.embedded, 4);
        assert_eq!(embedded.skipped, 0);
        assert_eq!(embedded.dim, DIMS);

        let stats = pipeline.store().stats().await.unwrap();
        assert_eq!((stats.documents, stats.chunks, stats.embeddings), (1, 4, 4));
    }

    #[tokio::test]
    async fn rechunking_replaces_the_previous_set() {
        let pipeline = pipeline(manual_extractor());
        let (_dir, document) = registered_with_file(&pipeline).await;
        pipeline.parse_pages(document.id).await.unwrap();
        pipeline.store_toc(document.id).await.unwrap();
        pipeline.chunk_document(document.id).await.unwrap();
        pipeline.embed_document(document.id).await.unwrap();

        let again = pipeline.chunk_document(document.id).await.unwrap();
        assert_eq!(again.chunks_created, 4);
        let stats = pipeline.store().stats().await.unwrap();
        assert_eq!((stats.chunks, stats.embeddings), (4, 0));
    }

    #[tokio::test]
    async fn chunking_without_toc_or_text_reports_a_note() {
        let pipeline = pipeline(manual_extractor());
        let (_dir, document) = registered_with_file(&pipeline).await;

        let report = pipeline.chunk_document(document.id).await.unwrap();
        assert_eq!(report.chunks_created, 0);
        assert_eq!(report.note.as_deref(), Some(NOTE_NO_STORED_TOC));

        pipeline.store_toc(document.id).await.unwrap();
        let report = pipeline.chunk_document(document.id).await.unwrap();
        assert_eq!(report.chunks_created, 0);
        assert_eq!(report.sections_seen, 4);
        assert_eq!(report.note.as_deref(), Some(NOTE_NO_SECTION_TEXT));
    }

    #[tokio::test]
    async fn missing_outline_stores_nothing() {
        let mut extractor = manual_extractor();
        extractor.toc.clear();
        let pipeline = pipeline(extractor);
        let (_dir, document) = registered_with_file(&pipeline).await;

        let report = pipeline.store_toc(document.id).await.unwrap();
        assert_eq!(report.stored, 0);
        assert_eq!(report.note.as_deref(), Some(NOTE_NO_OUTLINE));
        assert!(pipeline.toc(document.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_documents_and_missing_paths_are_rejected() {
        let pipeline = pipeline(manual_extractor());
        assert!(matches!(
            pipeline.parse_pages(42).await,
            Err(IngestError::NotFound(_))
        ));

        let document = pipeline
            .register_document(NewDocument {
                title: "No file".to_string(),
                source_url: "https://example.com/none.pdf".to_string(),
                local_path: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            pipeline.parse_pages(document.id).await,
            Err(IngestError::InvalidArgument(_))
        ));
        assert!(matches!(
            pipeline
                .set_local_path(document.id, Path::new("/definitely/not/here.pdf"))
                .await,
            Err(IngestError::InvalidArgument(_))
        ));
        assert!(matches!(
            pipeline
                .register_document(NewDocument {
                    title: "  ".to_string(),
                    source_url: "x".to_string(),
                    local_path: None,
                })
                .await,
            Err(IngestError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn embedding_a_document_without_chunks_is_not_found() {
        let pipeline = pipeline(manual_extractor());
        let (_dir, document) = registered_with_file(&pipeline).await;
        assert!(matches!(
            pipeline.embed_document(document.id).await,
            Err(IngestError::NotFound(_))
        ));
        assert!(matches!(
            pipeline.embed_chunk(12345).await,
            Err(IngestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped_and_batches_counted() {
        let pipeline = pipeline(manual_extractor()).with_embedding(EmbeddingOptions { batch_size: 2 });
        let (_dir, document) = registered_with_file(&pipeline).await;

        let chunks = (0..5)
            .map(|index| Chunk {
                document_id: document.id,
                section_path: "Only".to_string(),
                level: 1,
                start_page: 1,
                end_page: 1,
                chunk_index: index,
                content: if index == 4 {
                    "  ".to_string()
                } else {
                    format!("chunk {index}")
                },
            })
            .collect::<Vec<_>>();
        pipeline
            .store()
            .replace_chunks(document.id, &chunks)
            .await
            .unwrap();

        let report = pipeline.embed_document(document.id).await.unwrap();
        assert_eq!(report.total_chunks, 5);
        assert_eq!(report.embedded, 4);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.batches, 2);
    }

    #[tokio::test]
    async fn wrong_width_vectors_are_never_stored() {
        let pipeline = pipeline_with(manual_extractor(), Arc::new(HashEmbedder { dimensions: 4 }));
        let (_dir, document) = registered_with_file(&pipeline).await;
        pipeline.parse_pages(document.id).await.unwrap();
        pipeline.store_toc(document.id).await.unwrap();
        pipeline.chunk_document(document.id).await.unwrap();

        assert!(matches!(
            pipeline.embed_document(document.id).await,
            Err(IngestError::DimensionMismatch {
                expected: DIMS,
                actual: 4
            })
        ));
        assert_eq!(pipeline.store().stats().await.unwrap().embeddings, 0);
    }

    #[tokio::test]
    async fn a_failed_batch_keeps_earlier_batches() {
        let embedder = FlakyEmbedder {
            inner: HashEmbedder { dimensions: DIMS },
            succeed: 1,
            calls: AtomicUsize::new(0),
        };
        let pipeline = pipeline_with(manual_extractor(), Arc::new(embedder))
            .with_embedding(EmbeddingOptions { batch_size: 3 });
        let (_dir, document) = registered_with_file(&pipeline).await;
        pipeline.parse_pages(document.id).await.unwrap();
        pipeline.store_toc(document.id).await.unwrap();
        pipeline.chunk_document(document.id).await.unwrap();

        assert!(matches!(
            pipeline.embed_document(document.id).await,
            Err(IngestError::Embedding(EmbeddingError::Provider(_)))
        ));
        assert_eq!(pipeline.store().stats().await.unwrap().embeddings, 3);
    }

    #[tokio::test]
    async fn single_chunk_embedding() {
        let pipeline = pipeline(manual_extractor());
        let (_dir, document) = registered_with_file(&pipeline).await;
        pipeline.parse_pages(document.id).await.unwrap();
        pipeline.store_toc(document.id).await.unwrap();
        pipeline.chunk_document(document.id).await.unwrap();

        let chunk_id = pipeline.store().chunks_for_document(document.id).await.unwrap()[0].id;
        let report = pipeline.embed_chunk(chunk_id).await.unwrap();
        assert_eq!(report.dim, DIMS);
        assert_eq!(report.provider, "hash-sha256");
        assert_eq!(pipeline.store().stats().await.unwrap().embeddings, 1);
    }

    #[tokio::test]
    async fn folder_registration_is_recursive_and_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("b.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("a.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(base.join("notes.txt"))?;

        let pipeline = pipeline(manual_extractor());
        let documents = pipeline.register_folder(base).await?;

        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].title, "b");
        assert_eq!(documents[1].title, "a");
        assert!(documents.iter().all(|doc| doc.source_url.starts_with("file://")));
        assert_eq!(pipeline.list_documents().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn folder_without_pdfs_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pipeline = pipeline(manual_extractor());
        assert!(matches!(
            pipeline.register_folder(dir.path()).await,
            Err(IngestError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn folder_ingest_skips_unreadable_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("unreadable.pdf"), b"%PDF-1.4\n%broken")?;

        let pipeline = IngestPipeline::new(
            Arc::new(MemoryStore::new(DIMS)),
            Arc::new(LopdfExtractor),
            Arc::new(HashEmbedder { dimensions: DIMS }),
        );
        let report = pipeline.ingest_folder(dir.path()).await?;

        assert!(report.documents.is_empty());
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("unreadable.pdf")
        );
        Ok(())
    }

    async fn serve_once(
        status: &'static str,
        body: &'static [u8],
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/pdf\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_lowercase()
        });
        (format!("http://{address}/files/manual.pdf"), handle)
    }

    fn local_http_client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn download_copies_a_file_source_and_sets_local_path() {
        let pipeline = pipeline(manual_extractor());
        let dir = tempdir().unwrap();
        let source = dir.path().join("upstream.pdf");
        fs::write(&source, b"%PDF-1.4\n%downloaded").unwrap();

        let document = pipeline
            .register_document(NewDocument {
                title: "Pump Manual / Rev 2".to_string(),
                source_url: Url::from_file_path(fs::canonicalize(&source).unwrap())
                    .unwrap()
                    .to_string(),
                local_path: None,
            })
            .await
            .unwrap();

        let docs_dir = dir.path().join("storage").join("docs");
        let report = pipeline.download_document(document.id, &docs_dir).await.unwrap();

        let expected = fs::canonicalize(&docs_dir).unwrap().join("Pump_Manual___Rev_2.pdf");
        assert_eq!(report.bytes, 20);
        assert_eq!(
            report.document.local_path.as_deref(),
            Some(&*expected.to_string_lossy())
        );
        assert_eq!(fs::read(&expected).unwrap(), b"%PDF-1.4\n%downloaded");

        let pages = pipeline.parse_pages(document.id).await.unwrap();
        assert_eq!(pages.pages_total, 10);
    }

    #[tokio::test]
    async fn download_fetches_http_sources() {
        let (url, server) = serve_once("200 OK", b"%PDF-1.7\n%remote").await;
        let pipeline = pipeline(manual_extractor()).with_http_client(local_http_client());
        let document = pipeline
            .register_document(NewDocument {
                title: "remote.PDF".to_string(),
                source_url: url,
                local_path: None,
            })
            .await
            .unwrap();

        let dir = tempdir().unwrap();
        let report = pipeline.download_document(document.id, dir.path()).await.unwrap();
        let request = server.await.unwrap();

        assert!(request.starts_with("get /files/manual.pdf "));
        assert!(request.contains("user-agent: manual-search/"));
        assert_eq!(report.bytes, 16);
        let saved = PathBuf::from(report.document.local_path.unwrap());
        assert_eq!(saved.file_name().and_then(|name| name.to_str()), Some("remote.PDF"));
        assert_eq!(fs::read(saved).unwrap(), b"%PDF-1.7\n%remote");
    }

    #[tokio::test]
    async fn failed_downloads_leave_local_path_unset() {
        let (url, server) = serve_once("404 Not Found", b"missing").await;
        let pipeline = pipeline(manual_extractor()).with_http_client(local_http_client());
        let document = pipeline
            .register_document(NewDocument {
                title: "Gone".to_string(),
                source_url: url,
                local_path: None,
            })
            .await
            .unwrap();

        let dir = tempdir().unwrap();
        assert!(matches!(
            pipeline.download_document(document.id, dir.path()).await,
            Err(IngestError::Download(_))
        ));
        server.await.unwrap();
        assert_eq!(pipeline.get_document(document.id).await.unwrap().local_path, None);

        let ftp = pipeline
            .register_document(NewDocument {
                title: "Ftp".to_string(),
                source_url: "ftp://example.com/manual.pdf".to_string(),
                local_path: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            pipeline.download_document(ftp.id, dir.path()).await,
            Err(IngestError::InvalidArgument(_))
        ));
        assert!(matches!(
            pipeline.download_document(999, dir.path()).await,
            Err(IngestError::NotFound(_))
        ));
    }

    #[test]
    fn previews_are_cut_with_an_ellipsis() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(301);
        let cut = preview(&long);
        assert_eq!(cut.chars().count(), 301);
        assert!(cut.ends_with('…'));
    }
}
