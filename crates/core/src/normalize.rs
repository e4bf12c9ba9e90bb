//! Cleanup of text extracted from PDF pages.
//!
//! Extraction tends to leave behind UTF-8 text that was decoded as
//! Windows-1252 somewhere upstream, typographic punctuation, invisible
//! joiners and ragged whitespace. [`normalize_text`] folds all of that into a
//! stable plain form that is safe to diff, chunk and embed.

use unicode_normalization::UnicodeNormalization;

/// Mis-decoded byte sequences and the character they were meant to be.
/// Applied in order; the bare `Â` prefix removal also repairs `Â©`, `Â®`, `Â·`.
const MOJIBAKE_FIXES: &[(&str, &str)] = &[
    ("â€“", "\u{2013}"),
    ("â€”", "\u{2014}"),
    ("â€˜", "\u{2018}"),
    ("â€™", "\u{2019}"),
    ("â€œ", "\u{201c}"),
    ("â€\u{fffd}", "\u{201d}"),
    ("â€¦", "\u{2026}"),
    ("â€¢", "\u{2022}"),
    ("Â", ""),
    ("â„¢", "\u{2122}"),
    ("Ã—", "\u{d7}"),
    ("âˆ’", "\u{2212}"),
    ("â¦", "\u{2026}"),
];

const CANONICAL_PUNCTUATION: &[(char, char)] = &[
    ('\u{2018}', '\''),
    ('\u{2019}', '\''),
    ('\u{201a}', '\''),
    ('\u{201c}', '"'),
    ('\u{201d}', '"'),
    ('\u{201e}', '"'),
    ('\u{2013}', '-'),
    ('\u{2014}', '-'),
    ('\u{2022}', '-'),
];

const INVISIBLE: &[char] = &['\u{200b}', '\u{feff}', '\u{2060}', '\u{ad}'];

// Each character pass shrinks the text or maps a character to ASCII, so a
// fixed point is reached quickly; the cap only guards pathological input.
const MAX_REPAIR_PASSES: usize = 8;

/// Normalizes extracted page text. Pure, total and idempotent.
pub fn normalize_text(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let mut text = repair_characters(raw);
    for _ in 1..MAX_REPAIR_PASSES {
        let next = repair_characters(&text);
        if next == text {
            break;
        }
        text = next;
    }

    collapse_layout(&text)
}

fn repair_characters(input: &str) -> String {
    let mut text: String = input.nfc().collect();

    for (bad, good) in MOJIBAKE_FIXES {
        if text.contains(bad) {
            text = text.replace(bad, good);
        }
    }

    text.chars()
        .filter(|ch| !INVISIBLE.contains(ch))
        .map(|ch| {
            if ch == '\u{a0}' {
                return ' ';
            }
            CANONICAL_PUNCTUATION
                .iter()
                .find(|(from, _)| *from == ch)
                .map_or(ch, |(_, to)| *to)
        })
        .collect()
}

fn collapse_layout(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");

    unified
        .split('\n')
        .map(collapse_blank_runs)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Collapses runs of three or more spaces/tabs into one space and trims the
/// end of the line. Runs of one or two are kept as-is.
fn collapse_blank_runs(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut run = String::new();

    for ch in line.chars() {
        if ch == ' ' || ch == '\t' {
            run.push(ch);
            continue;
        }
        flush_run(&mut out, &mut run);
        out.push(ch);
    }
    flush_run(&mut out, &mut run);

    out.trim_end().to_string()
}

fn flush_run(out: &mut String, run: &mut String) {
    if run.chars().count() >= 3 {
        out.push(' ');
    } else {
        out.push_str(run);
    }
    run.clear();
}

/// Turns a content prefix into a display preview: normalized, with digit-only
/// lines (page-number artifacts) dropped and blank runs collapsed.
pub fn clean_preview(raw: &str) -> String {
    let normalized = normalize_text(raw);
    let kept = normalized
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.is_empty() || !trimmed.chars().all(char::is_numeric)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut out = String::with_capacity(kept.len());
    let mut in_blank = false;
    for ch in kept.chars() {
        if ch == ' ' || ch == '\t' {
            if !in_blank {
                out.push(' ');
            }
            in_blank = true;
        } else {
            out.push(ch);
            in_blank = false;
        }
    }
    out.trim().to_string()
}
