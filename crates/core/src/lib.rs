pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod export;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod paginator;
pub mod ranking;
pub mod search;
pub mod stores;
pub mod toc;
pub mod traits;

pub use chunking::{build_chunks, split_by_paragraphs};
pub use embeddings::{
    check_dimensions, Embedder, HashEmbedder, OpenAiConfig, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, IngestError, SearchError, StoreError};
pub use export::{
    export_chunks, export_hits, ExportReport, ExportedChunk, HitExportReport, DEFAULT_HIT_FIELDS,
};
pub use extractor::{LopdfExtractor, PdfExtractor, RawPage};
pub use ingest::{
    discover_pdf_files, ChunkReport, DocumentIngestReport, DownloadReport, EmbedChunkReport,
    EmbedReport, FolderIngestReport, IngestPipeline, ParsePagesReport, SkippedPdf, StoreTocReport,
};
pub use models::{
    Chunk, ChunkingOptions, Document, EmbeddingOptions, EmbeddingRecord, HeadingEntry,
    NeighborRow, NewDocument, PageText, QueryFilters, SearchCandidate, SearchHit, SearchOptions,
    SearchRequest, SearchResponse, SectionRange, StoredChunk, EMBEDDING_DIMENSIONS,
};
pub use normalize::{clean_preview, normalize_text};
pub use orchestrator::SearchService;
pub use paginator::{CollectedResults, HttpSearchClient, ResultPaginator, SearchEndpoint};
pub use ranking::{rank, Highlighter, RankedPage};
pub use search::QueryExecutor;
pub use stores::{MemoryStore, PgVectorStore};
pub use toc::{resolve_ranges, TocLayout};
pub use traits::{ChunkStore, DocumentStore, ManualStore, StoreStats, VectorIndex};
