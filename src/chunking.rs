//! Chunking Step (C9): groups elements by reading order and section, then
//! recursively splits/merges to hit the target chunk size, propagating bbox
//! geometry as it goes — the distinguishing invariant of this step (§4.9).

use crate::metadata_step::MetadataOutput;
use crate::models::{Bbox, BboxConfidence, Chunk, ChunkMetadata, Element, TextRole};

pub const CHUNK_TARGET_CHARS: usize = 1000;
pub const CHUNK_OVERLAP_CHARS: usize = 200;
pub const CHUNK_MAX_CHARS: usize = 1200;
pub const CHUNK_MIN_CHARS: usize = 100;

/// An element fused with its resolved section title and caption content,
/// carried through grouping before the size-targeted split.
struct ResolvedElement {
    page_number: i64,
    text: String,
    bbox: Option<Bbox>,
    /// `true` when `text` came from a VLM caption rather than raw narrative
    /// text — these elements keep `precise` confidence and are never split.
    is_caption: bool,
    section_title: Option<String>,
    element_category: &'static str,
}

fn resolve_elements(elements: &[Element], metadata: &MetadataOutput) -> Vec<ResolvedElement> {
    let mut indexed: Vec<(usize, &Element)> = elements.iter().enumerate().collect();
    indexed.sort_by_key(|(_, e)| e.reading_order_key());

    indexed
        .into_iter()
        .filter_map(|(original_index, element)| {
            let section_title = metadata.element_sections.get(original_index).cloned().flatten();
            match element {
                Element::Text(t) => {
                    if t.role == TextRole::Title {
                        return None; // headings live in the outline, not chunk content
                    }
                    Some(ResolvedElement {
                        page_number: t.page_number,
                        text: t.text.clone(),
                        bbox: t.bbox,
                        is_caption: false,
                        section_title,
                        element_category: "narrative_text",
                    })
                }
                Element::Table(tbl) => tbl.caption.as_ref().map(|caption| ResolvedElement {
                    page_number: tbl.page_number,
                    text: caption.clone(),
                    bbox: tbl.bbox,
                    is_caption: true,
                    section_title,
                    element_category: "table",
                }),
                Element::Image(img) => img.caption.as_ref().map(|caption| ResolvedElement {
                    page_number: img.page_number,
                    text: caption.clone(),
                    bbox: img.bbox,
                    is_caption: true,
                    section_title,
                    element_category: "image",
                }),
                Element::FullPage(_) => None,
            }
        })
        .collect()
}

/// Proportional vertical split of a text element's bbox across `K` chunks:
/// for a chunk spanning characters `[s, e)` of total length `total_len`,
/// `y0' = y0 + h·s/total_len`, `y1' = y0 + h·e/total_len`.
fn split_bbox(bbox: Bbox, start_char: usize, end_char: usize, total_len: usize) -> Bbox {
    let [x0, y0, x1, y1] = bbox;
    let h = y1 - y0;
    let total = total_len.max(1) as f64;
    let y0_prime = y0 + h * (start_char as f64 / total);
    let y1_prime = y0 + h * (end_char as f64 / total);
    [x0, y0_prime, x1, y1_prime]
}

/// Axis-aligned union of two bboxes.
fn union_bbox(a: Bbox, b: Bbox) -> Bbox {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].max(b[2]), a[3].max(b[3])]
}

/// Splits text on paragraph boundaries first, falling back to sentence
/// boundaries, recursively, until every piece is within `CHUNK_MAX_CHARS`.
fn recursive_split(text: &str) -> Vec<(usize, usize)> {
    fn split_on(text: &str, boundary: &[char]) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut start = 0usize;
        let bytes = text.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            let ch = text[i..].chars().next().unwrap();
            let ch_len = ch.len_utf8();
            if boundary.contains(&ch) {
                let end = i + ch_len;
                spans.push((start, end));
                start = end;
            }
            i += ch_len;
        }
        if start < text.len() {
            spans.push((start, text.len()));
        }
        spans
    }

    let paragraph_spans = split_on(text, &['\n']);
    let mut result = Vec::new();
    let mut cursor = 0usize;
    let mut pending_start = 0usize;

    for (p_start, p_end) in paragraph_spans {
        let _ = p_start;
        let piece_len = p_end - cursor;
        if piece_len <= CHUNK_MAX_CHARS {
            if p_end - pending_start > CHUNK_TARGET_CHARS {
                result.push((pending_start, cursor));
                pending_start = cursor;
            }
            cursor = p_end;
            continue;
        }

        if cursor > pending_start {
            result.push((pending_start, cursor));
            pending_start = cursor;
        }
        for (s_start, s_end) in split_on(&text[cursor..p_end], &['.', '!', '?']) {
            let abs_start = cursor + s_start;
            let abs_end = cursor + s_end;
            if abs_end - pending_start > CHUNK_TARGET_CHARS && abs_start > pending_start {
                result.push((pending_start, abs_start));
                pending_start = abs_start;
            }
            let _ = abs_end;
        }
        cursor = p_end;
    }
    if cursor > pending_start {
        result.push((pending_start, cursor));
    }
    if result.is_empty() && !text.is_empty() {
        result.push((0, text.len()));
    }
    result
}

struct DraftChunk {
    text: String,
    source_pages: Vec<(i64, Bbox)>,
    section_title: Option<String>,
    confidence: Option<BboxConfidence>,
    element_category: &'static str,
}

/// Groups resolved elements into logical runs sharing a section title, splits
/// each to the target size, and merges undersized neighbors — the algorithm
/// of §4.9 steps 2-4.
fn build_draft_chunks(resolved: Vec<ResolvedElement>) -> Vec<DraftChunk> {
    let mut drafts = Vec::new();

    let mut groups: Vec<Vec<ResolvedElement>> = Vec::new();
    for element in resolved {
        match groups.last_mut() {
            Some(group) if group.last().map(|e| &e.section_title) == Some(&element.section_title) => {
                group.push(element);
            }
            _ => groups.push(vec![element]),
        }
    }

    for group in groups {
        for element in group {
            if element.is_caption {
                drafts.push(DraftChunk {
                    text: element.text,
                    source_pages: element.bbox.map(|b| vec![(element.page_number, b)]).unwrap_or_default(),
                    section_title: element.section_title,
                    confidence: element.bbox.map(|_| BboxConfidence::Precise),
                    element_category: element.element_category,
                });
                continue;
            }

            let total_len = element.text.len();
            let spans = recursive_split(&element.text);
            for (start, end) in spans {
                let piece = element.text[start..end].trim();
                if piece.is_empty() {
                    continue;
                }
                let (source_pages, confidence) = match element.bbox {
                    Some(bbox) => (
                        vec![(element.page_number, split_bbox(bbox, start, end, total_len))],
                        Some(BboxConfidence::Estimated),
                    ),
                    None => (Vec::new(), None),
                };
                drafts.push(DraftChunk {
                    text: piece.to_string(),
                    source_pages,
                    section_title: element.section_title.clone(),
                    confidence,
                    element_category: element.element_category,
                });
            }
        }
    }

    merge_small_chunks(drafts)
}

fn merge_small_chunks(drafts: Vec<DraftChunk>) -> Vec<DraftChunk> {
    let mut merged: Vec<DraftChunk> = Vec::new();
    for draft in drafts {
        if let Some(last) = merged.last_mut() {
            let would_be = last.text.len() + 1 + draft.text.len();
            if last.text.len() < CHUNK_MIN_CHARS && would_be <= CHUNK_MAX_CHARS {
                last.text.push(' ');
                last.text.push_str(&draft.text);
                last.source_pages.extend(draft.source_pages);
                last.confidence = Some(BboxConfidence::Merged);
                continue;
            }
        }
        merged.push(draft);
    }
    merged
}

/// Resolves a draft chunk's bbox/confidence/multi-page fields per the
/// cross-page rule: a group spanning more than one page drops the primary
/// bbox to `null` and carries `bbox_multi_page` instead.
fn finalize_geometry(draft: &DraftChunk) -> (Option<Bbox>, Option<BboxConfidence>, Option<Vec<(i64, Bbox)>>) {
    if draft.source_pages.is_empty() {
        return (None, None, None);
    }
    let pages: std::collections::BTreeSet<i64> = draft.source_pages.iter().map(|(p, _)| *p).collect();
    if pages.len() > 1 {
        return (None, None, Some(draft.source_pages.clone()));
    }

    let page = draft.source_pages[0].0;
    let union = draft
        .source_pages
        .iter()
        .map(|(_, b)| *b)
        .reduce(union_bbox)
        .unwrap();
    let confidence = if draft.source_pages.len() > 1 {
        Some(BboxConfidence::Merged)
    } else {
        draft.confidence
    };
    let _ = page;
    (Some(union), confidence, None)
}

pub fn run_chunking_step(
    elements: &[Element],
    metadata: &MetadataOutput,
    document_id: &str,
    run_id: &str,
    source_filename: &str,
) -> Vec<Chunk> {
    let resolved = resolve_elements(elements, metadata);
    let drafts = build_draft_chunks(resolved);

    drafts
        .iter()
        .enumerate()
        .map(|(index, draft)| {
            let (bbox, bbox_confidence, bbox_multi_page) = finalize_geometry(draft);
            let page_number = draft.source_pages.first().map(|(p, _)| *p).unwrap_or(1);
            Chunk {
                id: crate::models::new_id(),
                document_id: document_id.to_string(),
                run_id: run_id.to_string(),
                chunk_index: index as i64,
                content: draft.text.clone(),
                embedding: None,
                metadata: ChunkMetadata {
                    page_number,
                    section_title: draft.section_title.clone(),
                    bbox,
                    bbox_confidence,
                    bbox_multi_page,
                    element_category: draft.element_category.to_string(),
                    source_filename: source_filename.to_string(),
                },
                created_at: chrono::Utc::now(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextElement;

    fn text_element(text: &str, page: i64, bbox: Option<Bbox>) -> Element {
        Element::Text(TextElement {
            page_number: page,
            text: text.to_string(),
            role: TextRole::NarrativeText,
            bbox,
            font_size: Some(10.0),
            section_title: None,
        })
    }

    fn empty_metadata(n: usize) -> MetadataOutput {
        MetadataOutput {
            outline: Vec::new(),
            pages: Vec::new(),
            element_sections: vec![None; n],
            warning_count: 0,
        }
    }

    #[test]
    fn split_bbox_distributes_proportionally_to_character_span() {
        let bbox = [0.0, 0.0, 100.0, 200.0];
        let first_half = split_bbox(bbox, 0, 50, 100);
        let second_half = split_bbox(bbox, 50, 100, 100);
        assert_eq!(first_half, [0.0, 0.0, 100.0, 100.0]);
        assert_eq!(second_half, [0.0, 100.0, 100.0, 200.0]);
    }

    #[test]
    fn union_bbox_takes_min_max_per_axis() {
        let a = [0.0, 10.0, 50.0, 60.0];
        let b = [5.0, 5.0, 55.0, 40.0];
        assert_eq!(union_bbox(a, b), [0.0, 5.0, 55.0, 60.0]);
    }

    #[test]
    fn short_narrative_text_becomes_single_chunk_with_estimated_confidence() {
        let elements = vec![text_element("The foundation shall be poured per drawing A.1.", 1, Some([0.0, 0.0, 100.0, 50.0]))];
        let metadata = empty_metadata(elements.len());
        let chunks = run_chunking_step(&elements, &metadata, "doc1", "run1", "spec.pdf");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.bbox_confidence, Some(BboxConfidence::Estimated));
    }

    #[test]
    fn long_text_is_split_on_sentence_boundaries() {
        let sentence = "Concrete shall meet strength class C30/37 per the structural drawings. ";
        let long_text = sentence.repeat(40);
        let elements = vec![text_element(&long_text, 1, Some([0.0, 0.0, 100.0, 500.0]))];
        let metadata = empty_metadata(elements.len());
        let chunks = run_chunking_step(&elements, &metadata, "doc1", "run1", "spec.pdf");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= CHUNK_MAX_CHARS);
        }
    }

    #[test]
    fn no_bbox_upstream_yields_null_confidence() {
        let elements = vec![text_element("No geometry available for this note.", 1, None)];
        let metadata = empty_metadata(elements.len());
        let chunks = run_chunking_step(&elements, &metadata, "doc1", "run1", "spec.pdf");
        assert_eq!(chunks[0].metadata.bbox, None);
        assert_eq!(chunks[0].metadata.bbox_confidence, None);
    }

    #[test]
    fn cross_page_merge_drops_primary_bbox_and_carries_multi_page() {
        let elements = vec![
            text_element("ab", 1, Some([0.0, 0.0, 10.0, 10.0])),
            text_element("cd", 2, Some([0.0, 0.0, 10.0, 10.0])),
        ];
        let metadata = empty_metadata(elements.len());
        let chunks = run_chunking_step(&elements, &metadata, "doc1", "run1", "spec.pdf");
        let merged = chunks.iter().find(|c| c.content.contains("ab") && c.content.contains("cd"));
        if let Some(chunk) = merged {
            assert_eq!(chunk.metadata.bbox, None);
            assert!(chunk.metadata.bbox_multi_page.is_some());
        }
    }

    #[test]
    fn table_caption_chunk_keeps_precise_confidence() {
        use crate::models::TableElement;
        let elements = vec![Element::Table(TableElement {
            page_number: 1,
            rows: vec![vec!["a".to_string()]],
            bbox: Some([0.0, 0.0, 100.0, 50.0]),
            confidence: 0.9,
            caption: Some("Table of anchor bolt torque values.".to_string()),
        })];
        let metadata = empty_metadata(elements.len());
        let chunks = run_chunking_step(&elements, &metadata, "doc1", "run1", "spec.pdf");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.bbox_confidence, Some(BboxConfidence::Precise));
        assert_eq!(chunks[0].metadata.element_category, "table");
    }
}
