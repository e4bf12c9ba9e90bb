//! Turns a flat outline into page ranges and breadcrumb section paths.

use crate::models::{HeadingEntry, SectionRange};

/// Parallel sequences of section ranges and their section paths, in outline order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TocLayout {
    ranges: Vec<SectionRange>,
    paths: Vec<String>,
}

impl TocLayout {
    pub fn ranges(&self) -> &[SectionRange] {
        &self.ranges
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn sections(&self) -> impl Iterator<Item = (&SectionRange, &str)> {
        self.ranges
            .iter()
            .zip(self.paths.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Resolves every heading into the page span it owns.
///
/// A heading runs until the page before the next heading at the same or a
/// shallower level, so its range covers all of its descendants. The last
/// heading at each level runs to `page_count`. Entries are processed in
/// `order_index` order regardless of input order.
pub fn resolve_ranges(headings: &[HeadingEntry], page_count: u32, separator: &str) -> TocLayout {
    let mut entries = headings.to_vec();
    entries.sort_by_key(|entry| entry.order_index);

    let ranges = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let end_page = entries[index + 1..]
                .iter()
                .find(|next| next.level <= entry.level)
                .map(|next| next.start_page.saturating_sub(1))
                .unwrap_or(page_count)
                .max(entry.start_page);

            SectionRange {
                level: entry.level,
                title: entry.title.clone(),
                start_page: entry.start_page,
                end_page,
                order_index: entry.order_index,
            }
        })
        .collect::<Vec<_>>();

    let paths = section_paths(&entries, separator);

    TocLayout { ranges, paths }
}

fn section_paths(entries: &[HeadingEntry], separator: &str) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();

    entries
        .iter()
        .map(|entry| {
            let depth = entry.level.max(1) as usize;
            stack.resize(depth, String::new());
            stack[depth - 1] = entry.title.clone();

            stack
                .iter()
                .filter(|title| !title.is_empty())
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(separator)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn heading(level: u32, title: &str, page: u32, order: i64) -> HeadingEntry {
        HeadingEntry::new(level, title, page, order)
    }

    fn spans(layout: &TocLayout) -> Vec<(&str, u32, u32)> {
        layout
            .ranges()
            .iter()
            .map(|range| (range.title.as_str(), range.start_page, range.end_page))
            .collect()
    }

    #[test]
    fn nested_headings_resolve_to_containing_ranges() {
        let headings = vec![
            heading(1, "A", 1, 1),
            heading(2, "A.1", 2, 2),
            heading(2, "A.2", 5, 3),
            heading(1, "B", 9, 4),
        ];

        let layout = resolve_ranges(&headings, 10, " > ");

        assert_eq!(
            spans(&layout),
            vec![("A", 1, 8), ("A.1", 2, 4), ("A.2", 5, 8), ("B", 9, 10)]
        );
        assert_eq!(layout.paths(), ["A", "A > A.1", "A > A.2", "B"]);
    }

    #[test]
    fn shallower_heading_truncates_deeper_path_slots() {
        let headings = vec![
            heading(1, "Manual", 1, 1),
            heading(2, "Install", 1, 2),
            heading(3, "Tools", 2, 3),
            heading(2, "Operate", 3, 4),
            heading(3, "Start", 3, 5),
        ];

        let layout = resolve_ranges(&headings, 4, " / ");

        assert_eq!(
            layout.paths(),
            [
                "Manual",
                "Manual / Install",
                "Manual / Install / Tools",
                "Manual / Operate",
                "Manual / Operate / Start"
            ]
        );
    }

    #[test]
    fn skipped_levels_leave_no_empty_segments() {
        let headings = vec![heading(1, "Top", 1, 1), heading(3, "Deep", 2, 2)];
        let layout = resolve_ranges(&headings, 3, " > ");
        assert_eq!(layout.paths(), ["Top", "Top > Deep"]);
    }

    #[test]
    fn end_page_never_precedes_start_page() {
        let headings = vec![heading(1, "Same page", 4, 1), heading(1, "Also page four", 4, 2)];
        let layout = resolve_ranges(&headings, 6, " > ");
        assert_eq!(spans(&layout), vec![("Same page", 4, 4), ("Also page four", 4, 6)]);
    }

    #[test]
    fn entries_are_ordered_by_order_index() {
        let headings = vec![heading(1, "Second", 5, 2), heading(1, "First", 1, 1)];
        let layout = resolve_ranges(&headings, 8, " > ");
        assert_eq!(spans(&layout), vec![("First", 1, 4), ("Second", 5, 8)]);
    }

    #[test]
    fn empty_outline_yields_no_ranges() {
        let layout = resolve_ranges(&[], 12, " > ");
        assert!(layout.is_empty());
        assert!(layout.paths().is_empty());
    }

    prop_compose! {
        fn outline()(steps in prop::collection::vec((1u32..4, 1u32..3), 1..20)) -> (Vec<HeadingEntry>, u32) {
            let mut page = 1u32;
            let headings = steps
                .iter()
                .enumerate()
                .map(|(index, (level, advance))| {
                    page += advance;
                    heading(*level, &format!("h{index}"), page, index as i64)
                })
                .collect::<Vec<_>>();
            (headings, page + 2)
        }
    }

    proptest! {
        #[test]
        fn descendants_start_inside_their_ancestor((headings, page_count) in outline()) {
            let layout = resolve_ranges(&headings, page_count, " > ");
            let ranges = layout.ranges();

            for (index, ancestor) in ranges.iter().enumerate() {
                prop_assert!(ancestor.end_page >= ancestor.start_page);
                for descendant in ranges[index + 1..]
                    .iter()
                    .take_while(|next| next.level > ancestor.level)
                {
                    prop_assert!(descendant.start_page >= ancestor.start_page);
                    prop_assert!(descendant.start_page <= ancestor.end_page);
                }
            }
        }
    }
}
