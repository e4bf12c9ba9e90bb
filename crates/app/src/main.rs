use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use manual_search_core::{
    export_chunks, export_hits, ChunkingOptions, CollectedResults, Embedder, EmbeddingOptions, HashEmbedder,
    HttpSearchClient, IngestPipeline, LopdfExtractor, ManualStore, MemoryStore, NewDocument,
    OpenAiConfig, OpenAiEmbedder, PgVectorStore, ResultPaginator, SearchHit,
    SearchOptions, SearchRequest, SearchResponse, SearchService, DEFAULT_HIT_FIELDS,
    EMBEDDING_DIMENSIONS,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "manual-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Postgres URL with the pgvector extension. Without it an in-memory
    /// store is used and discarded on exit.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Embedding provider.
    #[arg(long, env = "EMBEDDING_PROVIDER", value_enum, default_value_t = Provider::Hash, global = true)]
    embedding_provider: Provider,

    /// API key for the openai provider.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    openai_api_key: Option<String>,

    /// Base URL of an OpenAI-compatible embeddings API.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1", global = true)]
    openai_base_url: String,

    /// Embedding model for the openai provider.
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small", global = true)]
    embedding_model: String,

    /// Print machine-readable JSON instead of text.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Provider {
    Hash,
    Openai,
}

#[derive(Subcommand)]
enum Command {
    /// Register one document.
    Register {
        #[arg(long)]
        title: String,
        #[arg(long)]
        source_url: String,
        #[arg(long)]
        local_path: Option<PathBuf>,
    },
    /// Register every PDF under a folder.
    RegisterFolder {
        #[arg(long)]
        folder: PathBuf,
    },
    /// List registered documents.
    Documents,
    /// Point a document at its PDF on disk.
    SetLocalPath {
        #[arg(long)]
        document_id: i64,
        #[arg(long)]
        path: PathBuf,
    },
    /// Fetch a document's source URL into the docs folder and set its local path.
    Download {
        #[arg(long)]
        document_id: i64,
        #[arg(long, env = "DOCS_DIR", default_value = "storage/docs")]
        docs_dir: PathBuf,
    },
    /// Extract, normalize and store page text.
    ParsePages {
        #[arg(long)]
        document_id: i64,
    },
    /// Read the PDF outline and store it.
    StoreToc {
        #[arg(long)]
        document_id: i64,
    },
    /// Show the stored outline, or the PDF's own with --from-pdf.
    Toc {
        #[arg(long)]
        document_id: i64,
        #[arg(long, default_value_t = false)]
        from_pdf: bool,
    },
    /// Rebuild the chunks of a document from its stored outline and pages.
    Chunk {
        #[arg(long)]
        document_id: i64,
        #[arg(long, default_value_t = 2000)]
        max_chars: usize,
    },
    /// Embed every chunk of a document.
    Embed {
        #[arg(long)]
        document_id: i64,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },
    /// Embed a single chunk.
    EmbedChunk {
        #[arg(long)]
        chunk_id: i64,
    },
    /// Register a folder and run every stage for each PDF, skipping failures.
    Ingest {
        #[arg(long)]
        folder: PathBuf,
        /// Search right after ingesting (useful with the in-memory store).
        #[arg(long)]
        query: Option<String>,
    },
    /// Run one page of a search.
    Search {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Collect every page of a search, locally or from a remote server.
    Paginate {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, default_value_t = 5)]
        page_size: usize,
        #[arg(long, default_value_t = ResultPaginator::DEFAULT_MAX_PAGES)]
        max_pages: usize,
        /// Search server base URL; the local store is queried when absent.
        #[arg(long, env = "SEARCH_BASE_URL")]
        base_url: Option<String>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[command(flatten)]
        export: HitExportArgs,
    },
    /// Write a document's chunks to text files plus a chunks.json index.
    ExportChunks {
        #[arg(long)]
        document_id: i64,
        #[arg(long, default_value = "storage/chunks")]
        out: PathBuf,
    },
    /// Count documents, chunks and embeddings.
    Stats,
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long)]
    query: String,
    #[arg(long)]
    document_id: Option<i64>,
    /// Drop chunks whose section path equals this value; repeatable.
    #[arg(long = "exclude-section")]
    exclude_section: Vec<String>,
    #[arg(long, default_value_t = 60)]
    min_chars: usize,
    #[arg(long, default_value_t = false)]
    clean_preview: bool,
    #[arg(long, default_value_t = false)]
    no_highlight: bool,
}

#[derive(Args)]
struct HitExportArgs {
    /// Write the collected hits as JSON lines.
    #[arg(long)]
    out_jsonl: Option<PathBuf>,
    /// Write the collected hits as CSV.
    #[arg(long)]
    out_csv: Option<PathBuf>,
    /// Comma-separated hit fields to export.
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_HIT_FIELDS.iter().map(|field| field.to_string()))]
    fields: Vec<String>,
}

impl QueryArgs {
    fn request(&self, top_k: usize, offset: usize) -> SearchRequest {
        let mut request = SearchRequest::new(self.query.clone());
        request.top_k = top_k;
        request.offset = offset;
        request.document_id = self.document_id;
        request.exclude_section_exact = self.exclude_section.clone();
        request.min_chars = self.min_chars;
        request.clean_preview = self.clean_preview;
        request.highlight_terms = !self.no_highlight;
        request
    }
}

fn build_embedder(cli: &Cli) -> anyhow::Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match cli.embedding_provider {
        Provider::Hash => Arc::new(HashEmbedder {
            dimensions: EMBEDDING_DIMENSIONS,
        }),
        Provider::Openai => {
            let mut config = OpenAiConfig::new(cli.openai_api_key.clone().unwrap_or_default());
            config.base_url = cli.openai_base_url.clone();
            config.model = cli.embedding_model.clone();
            Arc::new(OpenAiEmbedder::new(config)?)
        }
    };
    Ok(embedder)
}

async fn open_store(cli: &Cli) -> anyhow::Result<Arc<dyn ManualStore>> {
    let store: Arc<dyn ManualStore> = match &cli.database_url {
        Some(url) => {
            let store = PgVectorStore::connect(url, EMBEDDING_DIMENSIONS)
                .await
                .context("connecting to postgres")?;
            store.ensure_schema().await.context("preparing schema")?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory store discarded on exit");
            Arc::new(MemoryStore::new(EMBEDDING_DIMENSIONS))
        }
    };
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_hit(hit: &SearchHit) {
    println!(
        "[{}] score={:.4} distance={:.4} document_id={} chunk_index={}",
        hit.chunk_id, hit.score, hit.distance, hit.document_id, hit.chunk_index
    );
    if let Some(section) = &hit.section_path {
        println!("  section={section} pages={}-{}", hit.start_page, hit.end_page);
    }
    if let Some(url) = &hit.page_url {
        println!("  url={url}");
    }
    let preview = hit
        .preview_marked
        .as_deref()
        .or(hit.preview_clean.as_deref())
        .unwrap_or(&hit.preview);
    println!("  {}", preview.replace('\n', "\n  "));
}

fn print_response(response: &SearchResponse, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(response);
    }
    println!("query: {}", response.query);
    for hit in &response.results {
        print_hit(hit);
    }
    match response.next_offset {
        Some(next) => println!("next_offset: {next}"),
        None => println!("next_offset: none"),
    }
    Ok(())
}

async fn finish_paginate(
    collected: &CollectedResults,
    export: &HitExportArgs,
    json: bool,
) -> anyhow::Result<()> {
    if export.out_jsonl.is_none() && export.out_csv.is_none() {
        return print_collected(collected, json);
    }
    let report = export_hits(
        &collected.hits,
        &export.fields,
        export.out_jsonl.as_deref(),
        export.out_csv.as_deref(),
    )
    .await?;
    if json {
        return print_json(&report);
    }
    for path in report.jsonl.iter().chain(report.csv.iter()) {
        println!("wrote {}", path.display());
    }
    println!(
        "{} row(s) exported over {} page(s){}",
        report.rows,
        collected.pages_fetched,
        if collected.truncated { " (page ceiling reached)" } else { "" }
    );
    Ok(())
}

fn print_collected(collected: &CollectedResults, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&collected.hits);
    }
    for hit in &collected.hits {
        print_hit(hit);
    }
    println!(
        "{} unique results over {} page(s){}",
        collected.hits.len(),
        collected.pages_fetched,
        if collected.truncated { " (page ceiling reached)" } else { "" }
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "manual-search boot"
    );

    // A remote paginate run needs neither a store nor an embedder.
    if let Command::Paginate {
        query,
        page_size,
        max_pages,
        base_url: Some(base_url),
        timeout_secs,
        export,
    } = &cli.command
    {
        let client = HttpSearchClient::new(base_url, Duration::from_secs(*timeout_secs))?;
        let collected = ResultPaginator::new(*page_size)
            .with_max_pages(*max_pages)
            .collect_all(&client, &query.request(*page_size, 0))
            .await?;
        return finish_paginate(&collected, export, cli.json).await;
    }

    let embedder = build_embedder(&cli)?;
    let store = open_store(&cli).await?;
    let pipeline = IngestPipeline::new(store.clone(), Arc::new(LopdfExtractor), embedder.clone());

    match &cli.command {
        Command::Register {
            title,
            source_url,
            local_path,
        } => {
            let document = pipeline
                .register_document(NewDocument {
                    title: title.clone(),
                    source_url: source_url.clone(),
                    local_path: local_path
                        .as_ref()
                        .map(|path| path.to_string_lossy().to_string()),
                })
                .await?;
            print_json(&document)?;
        }
        Command::RegisterFolder { folder } => {
            print_json(&pipeline.register_folder(folder).await?)?;
        }
        Command::Documents => {
            print_json(&pipeline.list_documents().await?)?;
        }
        Command::SetLocalPath { document_id, path } => {
            print_json(&pipeline.set_local_path(*document_id, path).await?)?;
        }
        Command::Download {
            document_id,
            docs_dir,
        } => {
            print_json(&pipeline.download_document(*document_id, docs_dir).await?)?;
        }
        Command::ParsePages { document_id } => {
            print_json(&pipeline.parse_pages(*document_id).await?)?;
        }
        Command::StoreToc { document_id } => {
            print_json(&pipeline.store_toc(*document_id).await?)?;
        }
        Command::Toc {
            document_id,
            from_pdf,
        } => {
            let entries = if *from_pdf {
                pipeline.pdf_toc(*document_id).await?
            } else {
                pipeline.toc(*document_id).await?
            };
            print_json(&entries)?;
        }
        Command::Chunk {
            document_id,
            max_chars,
        } => {
            if *max_chars == 0 {
                bail!("--max-chars must be positive");
            }
            let pipeline = pipeline.with_chunking(ChunkingOptions {
                max_chars: *max_chars,
                ..ChunkingOptions::default()
            });
            print_json(&pipeline.chunk_document(*document_id).await?)?;
        }
        Command::Embed {
            document_id,
            batch_size,
        } => {
            let pipeline = pipeline.with_embedding(EmbeddingOptions {
                batch_size: *batch_size,
            });
            print_json(&pipeline.embed_document(*document_id).await?)?;
        }
        Command::EmbedChunk { chunk_id } => {
            print_json(&pipeline.embed_chunk(*chunk_id).await?)?;
        }
        Command::Ingest { folder, query } => {
            let report = pipeline.ingest_folder(folder).await?;
            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
            }
            if cli.json {
                print_json(&report)?;
            } else {
                let chunks: usize = report
                    .documents
                    .iter()
                    .map(|document| document.chunks.chunks_created)
                    .sum();
                println!(
                    "{} document(s) ingested, {} skipped, {} chunks at {}",
                    report.documents.len(),
                    report.skipped_files.len(),
                    chunks,
                    Utc::now().to_rfc3339()
                );
            }

            if let Some(text) = query {
                let service = SearchService::new(store.clone(), embedder.clone(), SearchOptions::default());
                let response = service.search(&SearchRequest::new(text.clone())).await?;
                print_response(&response, cli.json)?;
            }
        }
        Command::Search {
            query,
            top_k,
            offset,
        } => {
            let service = SearchService::new(store.clone(), embedder.clone(), SearchOptions::default());
            let response = service.search(&query.request(*top_k, *offset)).await?;
            print_response(&response, cli.json)?;
        }
        Command::Paginate {
            query,
            page_size,
            max_pages,
            export,
            ..
        } => {
            let service = SearchService::new(store.clone(), embedder.clone(), SearchOptions::default());
            let collected = ResultPaginator::new(*page_size)
                .with_max_pages(*max_pages)
                .collect_all(&service, &query.request(*page_size, 0))
                .await?;
            finish_paginate(&collected, export, cli.json).await?;
        }
        Command::ExportChunks { document_id, out } => {
            print_json(&export_chunks(store.as_ref(), *document_id, out).await?)?;
        }
        Command::Stats => {
            print_json(&store.stats().await?)?;
        }
    }

    Ok(())
}
