use crate::error::IngestError;
use crate::models::{SearchHit, StoredChunk};
use crate::traits::ChunkStore;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, info_span, Instrument};

const MAX_NAME_CHARS: usize = 80;

/// Columns written by [`export_hits`] when none are chosen.
pub const DEFAULT_HIT_FIELDS: &[&str] = &[
    "document_id",
    "chunk_index",
    "section_path",
    "preview_clean",
    "start_page",
    "end_page",
    "score",
];

const HIT_FIELDS: &[&str] = &[
    "chunk_id",
    "distance",
    "score",
    "document_id",
    "document_title",
    "source_url",
    "page_url",
    "section_path",
    "chunk_index",
    "start_page",
    "end_page",
    "preview",
    "preview_clean",
    "preview_marked",
];

#[derive(Debug, Clone, Serialize)]
pub struct ExportedChunk {
    pub file: PathBuf,
    pub chunk_id: i64,
    pub section_path: String,
    pub level: u32,
    pub start_page: u32,
    pub end_page: u32,
    pub chunk_index: u32,
    pub chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub document_id: i64,
    pub dir: PathBuf,
    pub files_written: usize,
    pub index_json: PathBuf,
}

/// Keeps alphanumerics, `-`, `_` and `.`; everything else becomes `_`.
pub fn safe_file_name(name: &str) -> String {
    let safe = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_CHARS)
        .collect::<String>();
    if safe.is_empty() {
        "section".to_string()
    } else {
        safe
    }
}

fn render(chunk: &StoredChunk, section_path: &str) -> String {
    format!(
        "--- chunk_id: {}\n--- section_path: {}\n--- level: {}\n--- pages: {}-{}\n--- chunk_index: {}\n---\n\n{}",
        chunk.id,
        section_path,
        chunk.chunk.level,
        chunk.chunk.start_page,
        chunk.chunk.end_page,
        chunk.chunk.chunk_index,
        chunk.chunk.content
    )
}

/// Writes every chunk of a document to `<out_root>/doc_<id>/` as
/// `<NNNN>__<section>__ci_<k>.txt`, ordered by section path then chunk index,
/// plus a `chunks.json` index.
pub async fn export_chunks<S: ChunkStore + ?Sized>(
    store: &S,
    document_id: i64,
    out_root: &Path,
) -> Result<ExportReport, IngestError> {
    let mut chunks = store.chunks_for_document(document_id).await?;
    if chunks.is_empty() {
        return Err(IngestError::NotFound(format!(
            "no chunks for document {document_id}; run chunk first"
        )));
    }
    chunks.sort_by(|left, right| {
        left.chunk
            .section_path
            .cmp(&right.chunk.section_path)
            .then(left.chunk.chunk_index.cmp(&right.chunk.chunk_index))
    });

    let out_dir = out_root.join(format!("doc_{document_id}"));
    let span = info_span!("export-chunks", document_id, dir = %out_dir.display());
    async {
        let started = Instant::now();
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut index = Vec::with_capacity(chunks.len());
        for (position, chunk) in chunks.iter().enumerate() {
            let section_path = if chunk.chunk.section_path.is_empty() {
                "section"
            } else {
                chunk.chunk.section_path.as_str()
            };
            let file = out_dir.join(format!(
                "{:04}__{}__ci_{}.txt",
                position + 1,
                safe_file_name(section_path),
                chunk.chunk.chunk_index
            ));
            tokio::fs::write(&file, render(chunk, section_path)).await?;

            index.push(ExportedChunk {
                file,
                chunk_id: chunk.id,
                section_path: section_path.to_string(),
                level: chunk.chunk.level,
                start_page: chunk.chunk.start_page,
                end_page: chunk.chunk.end_page,
                chunk_index: chunk.chunk.chunk_index,
                chars: chunk.chunk.content.chars().count(),
            });
        }

        let index_json = out_dir.join("chunks.json");
        tokio::fs::write(&index_json, serde_json::to_string_pretty(&index)?).await?;

        info!(
            files = index.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exported chunks"
        );
        Ok::<_, IngestError>(ExportReport {
            document_id,
            dir: out_dir.clone(),
            files_written: index.len(),
            index_json,
        })
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct HitExportReport {
    pub rows: usize,
    pub fields: Vec<String>,
    pub jsonl: Option<PathBuf>,
    pub csv: Option<PathBuf>,
}

/// One exported hit: the chosen fields, in the chosen order.
struct PickedRow<'a> {
    fields: &'a [String],
    values: Vec<Value>,
}

impl Serialize for PickedRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (field, value) in self.fields.iter().zip(&self.values) {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

fn pick<'a>(hit: &SearchHit, fields: &'a [String]) -> Result<PickedRow<'a>, IngestError> {
    let value = serde_json::to_value(hit)?;
    let values = fields
        .iter()
        .map(|field| value.get(field.as_str()).cloned().unwrap_or(Value::Null))
        .collect();
    Ok(PickedRow { fields, values })
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

async fn ensure_parent(path: &Path) -> Result<(), IngestError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::create_dir_all(parent).await?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Writes search hits as JSON lines and/or CSV, keeping only `fields`.
/// Absent values are `null` in JSON and empty cells in CSV.
pub async fn export_hits(
    hits: &[SearchHit],
    fields: &[String],
    jsonl_path: Option<&Path>,
    csv_path: Option<&Path>,
) -> Result<HitExportReport, IngestError> {
    if jsonl_path.is_none() && csv_path.is_none() {
        return Err(IngestError::InvalidArgument(
            "choose a jsonl or csv output".to_string(),
        ));
    }
    if fields.is_empty() {
        return Err(IngestError::InvalidArgument("no fields selected".to_string()));
    }
    if let Some(unknown) = fields.iter().find(|field| !HIT_FIELDS.contains(&field.as_str())) {
        return Err(IngestError::InvalidArgument(format!(
            "unknown field {unknown:?}; expected one of {}",
            HIT_FIELDS.join(", ")
        )));
    }

    let span = info_span!("export-hits", rows = hits.len());
    async {
        let started = Instant::now();
        let rows = hits
            .iter()
            .map(|hit| pick(hit, fields))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(path) = jsonl_path {
            let mut body = String::new();
            for row in &rows {
                body.push_str(&serde_json::to_string(row)?);
                body.push('\n');
            }
            ensure_parent(path).await?;
            tokio::fs::write(path, body).await?;
        }

        if let Some(path) = csv_path {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(fields)?;
            for row in &rows {
                writer.write_record(row.values.iter().map(csv_cell))?;
            }
            let body = writer
                .into_inner()
                .map_err(|error| IngestError::Io(error.into_error()))?;
            ensure_parent(path).await?;
            tokio::fs::write(path, body).await?;
        }

        info!(
            fields = fields.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exported search hits"
        );
        Ok::<_, IngestError>(HitExportReport {
            rows: rows.len(),
            fields: fields.to_vec(),
            jsonl: jsonl_path.map(Path::to_path_buf),
            csv: csv_path.map(Path::to_path_buf),
        })
    }
    .instrument(span)
    .await
}
