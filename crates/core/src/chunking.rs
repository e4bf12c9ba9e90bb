use crate::models::{Chunk, ChunkingOptions};
use crate::toc::TocLayout;
use std::collections::BTreeMap;

const PARAGRAPH_BREAK: &str = "\n\n";
const PARAGRAPH_BREAK_CHARS: usize = 2;

/// Splits `text` into pieces of at most `max_chars` characters, preferring
/// paragraph (blank line) boundaries.
///
/// Lengths are counted in Unicode scalar values, so a hard split never cuts a
/// UTF-8 sequence, though it may separate a base character from a combining
/// mark. Paragraphs longer than `max_chars` are sliced at fixed offsets.
pub fn split_by_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);

    if char_len(text) <= max_chars {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }

    let paragraphs = text
        .split(PARAGRAPH_BREAK)
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty());

    let mut pieces = Vec::new();
    let mut buffer = String::new();
    let mut buffer_chars = 0usize;

    for paragraph in paragraphs {
        let paragraph_chars = char_len(paragraph);

        if paragraph_chars > max_chars {
            flush(&mut pieces, &mut buffer, &mut buffer_chars);
            pieces.extend(hard_split(paragraph, max_chars));
            continue;
        }

        let separator = if buffer.is_empty() { 0 } else { PARAGRAPH_BREAK_CHARS };
        if buffer_chars + separator + paragraph_chars <= max_chars {
            if separator > 0 {
                buffer.push_str(PARAGRAPH_BREAK);
            }
            buffer.push_str(paragraph);
            buffer_chars += separator + paragraph_chars;
        } else {
            flush(&mut pieces, &mut buffer, &mut buffer_chars);
            buffer.push_str(paragraph);
            buffer_chars = paragraph_chars;
        }
    }
    flush(&mut pieces, &mut buffer, &mut buffer_chars);

    pieces
}

fn flush(pieces: &mut Vec<String>, buffer: &mut String, buffer_chars: &mut usize) {
    let trimmed = buffer.trim();
    if !trimmed.is_empty() {
        pieces.push(trimmed.to_string());
    }
    buffer.clear();
    *buffer_chars = 0;
}

fn hard_split(paragraph: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = paragraph.chars().collect();
    chars
        .chunks(max_chars)
        .map(|slice| slice.iter().collect::<String>().trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Builds the ordered chunk sequence for one document.
///
/// Every section gathers the text of the pages in its range that exist in
/// `pages`, joined by a blank line. Sections with no text are skipped. Chunk
/// indices restart at zero for each section path.
pub fn build_chunks(
    document_id: i64,
    layout: &TocLayout,
    pages: &BTreeMap<u32, String>,
    options: &ChunkingOptions,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();

    for (range, section_path) in layout.sections() {
        if range.end_page < range.start_page {
            continue;
        }

        let section_text = pages
            .range(range.start_page..=range.end_page)
            .map(|(_, content)| content.as_str())
            .collect::<Vec<_>>()
            .join(PARAGRAPH_BREAK);
        let section_text = section_text.trim();

        if section_text.is_empty() {
            continue;
        }

        for (index, piece) in split_by_paragraphs(section_text, options.max_chars)
            .into_iter()
            .enumerate()
        {
            chunks.push(Chunk {
                document_id,
                section_path: section_path.to_string(),
                level: range.level,
                start_page: range.start_page,
                end_page: range.end_page,
                chunk_index: index as u32,
                content: piece,
            });
        }
    }

    chunks
}
