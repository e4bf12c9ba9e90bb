use crate::error::IngestError;
use crate::models::HeadingEntry;
use lopdf::Document;
use std::path::Path;
use tracing::debug;

/// Raw text of one page, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub number: u32,
    pub text: String,
}

/// Source of per-page text and the document outline.
pub trait PdfExtractor: Send + Sync {
    /// Every page in order, including pages without text.
    fn extract_pages(&self, path: &Path) -> Result<Vec<RawPage>, IngestError>;

    /// The outline as heading entries with `order_index` 1..n; empty when the
    /// PDF carries no outline.
    fn extract_toc(&self, path: &Path) -> Result<Vec<HeadingEntry>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl LopdfExtractor {
    fn load(path: &Path) -> Result<Document, IngestError> {
        Document::load(path).map_err(|error| {
            IngestError::PdfParse(format!("failed to open {}: {error}", path.display()))
        })
    }
}

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<RawPage>, IngestError> {
        let document = Self::load(path)?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            pages.push(RawPage {
                number: page_no,
                text: text.replace('\0', ""),
            });
        }

        Ok(pages)
    }

    fn extract_toc(&self, path: &Path) -> Result<Vec<HeadingEntry>, IngestError> {
        let document = Self::load(path)?;

        let outline = match document.get_toc() {
            Ok(outline) => outline,
            Err(error) => {
                debug!(path = %path.display(), %error, "pdf has no readable outline");
                return Ok(Vec::new());
            }
        };

        Ok(outline
            .toc
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                HeadingEntry::new(
                    u32::try_from(entry.level).unwrap_or(u32::MAX),
                    entry.title,
                    u32::try_from(entry.page).unwrap_or(u32::MAX),
                    index as i64 + 1,
                )
            })
            .collect())
    }
}
