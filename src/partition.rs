//! Partition Step (C6): hybrid PDF→elements extraction.
//!
//! Native path uses `lopdf` for both per-page text structure and the quick
//! whole-document sampling used by scanned-vs-native detection. OCR path
//! normalizes an `OcrProvider`'s output into the same `Element` schema.
//! Full-page rasterization is gated behind the optional `pdfium` feature so
//! the default build stays free of a native rasterizer dependency.

use std::collections::BTreeMap;

use crate::error::{CoreError, StepErrorKind};
use crate::models::{
    Bbox, Element, FullPageElement, ImageElement, TableElement, TextElement, TextRole,
};
use crate::object_store::ObjectStore;
use crate::ocr::OcrProvider;

const SCANNED_MEAN_CHARS_THRESHOLD: f64 = 25.0;
const SAMPLE_PAGES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageComplexity {
    TextOnly,
    Simple,
    Complex,
}

impl PageComplexity {
    pub fn raster_dpi(self) -> u32 {
        match self {
            PageComplexity::TextOnly | PageComplexity::Simple => 150,
            PageComplexity::Complex => 250,
        }
    }
}

pub struct PartitionResult {
    pub elements: Vec<Element>,
    pub page_count: i64,
    pub document_type: crate::models::DocumentType,
}

/// Samples the first `SAMPLE_PAGES` pages and returns mean extracted text
/// length, per §4.6's detection algorithm.
pub fn sample_mean_text_length(bytes: &[u8]) -> Result<f64, CoreError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| CoreError::Partition {
        kind: StepErrorKind::Unreadable,
        message: e.to_string(),
    })?;

    let pages = doc.get_pages();
    let sample: Vec<u32> = pages.keys().take(SAMPLE_PAGES).copied().collect();
    if sample.is_empty() {
        return Ok(0.0);
    }

    let mut total = 0usize;
    for page_num in &sample {
        let text = doc.extract_text(&[*page_num]).unwrap_or_default();
        total += text.chars().count();
    }
    Ok(total as f64 / sample.len() as f64)
}

pub fn detect_document_type(bytes: &[u8]) -> Result<crate::models::DocumentType, CoreError> {
    let mean_len = sample_mean_text_length(bytes)?;
    Ok(if mean_len < SCANNED_MEAN_CHARS_THRESHOLD {
        crate::models::DocumentType::Scanned
    } else {
        crate::models::DocumentType::Native
    })
}

/// Top-level entry point: detects document type, runs the matching
/// strategy, and falls back to native-on-OCR-unavailable per §4.6's failure
/// modes.
pub async fn partition_document(
    bytes: &[u8],
    source_filename: &str,
    ocr: Option<&dyn OcrProvider>,
    object_store: &ObjectStore,
    run_id: &str,
) -> Result<PartitionResult, CoreError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| CoreError::Partition {
        kind: StepErrorKind::Unreadable,
        message: e.to_string(),
    })?;
    let page_count = doc.get_pages().len() as i64;

    let document_type = detect_document_type(bytes)?;

    let elements = match document_type {
        crate::models::DocumentType::Native => partition_native(&doc, source_filename)?,
        crate::models::DocumentType::Scanned => match ocr {
            Some(provider) => match partition_ocr(bytes, provider, source_filename).await {
                Ok(elements) => elements,
                Err(_) => partition_native(&doc, source_filename)?,
            },
            None => partition_native(&doc, source_filename)?,
        },
        crate::models::DocumentType::Hybrid => partition_native(&doc, source_filename)?,
    };

    let total_chars: usize = elements
        .iter()
        .filter_map(|e| match e {
            Element::Text(t) => Some(t.text.len()),
            _ => None,
        })
        .sum();
    if total_chars == 0 {
        return Err(CoreError::Partition {
            kind: StepErrorKind::NoContent,
            message: "no extractable text after partitioning".to_string(),
        });
    }

    let elements = capture_full_page_renders(elements, bytes, object_store, run_id).await?;

    Ok(PartitionResult {
        elements,
        page_count,
        document_type,
    })
}

/// Native-strategy extraction: per-page text split into paragraphs, with
/// `Title | ListItem | NarrativeText` role inference and a table detector
/// operating on whitespace-delimited column heuristics, since `lopdf`'s
/// text extraction does not expose per-glyph font metrics the way a
/// structured-layout library would.
fn partition_native(doc: &lopdf::Document, source_filename: &str) -> Result<Vec<Element>, CoreError> {
    let pages: BTreeMap<u32, _> = doc.get_pages();
    let mut elements = Vec::new();
    let median_line_len = estimate_median_line_length(doc, &pages);

    for page_num in pages.keys() {
        let text = doc.extract_text(&[*page_num]).unwrap_or_default();
        let page_height = page_media_box_height(doc, *page_num).unwrap_or(792.0);

        let paragraphs: Vec<&str> = text
            .split("\n\n")
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        let n = paragraphs.len().max(1);

        let mut table_lines: Vec<&str> = Vec::new();

        for (i, paragraph) in paragraphs.iter().enumerate() {
            if looks_tabular(paragraph) {
                table_lines.push(paragraph);
                continue;
            }

            let bbox = estimate_paragraph_bbox(i, n, page_height);
            let role = infer_role(paragraph, median_line_len);
            elements.push(Element::Text(TextElement {
                page_number: *page_num as i64,
                text: paragraph.to_string(),
                role,
                bbox: Some(bbox),
                font_size: Some(if role == TextRole::Title { 16.0 } else { 10.0 }),
                section_title: None,
            }));
        }

        for (i, raw) in table_lines.iter().enumerate() {
            if let Some(table) = parse_table(raw, *page_num as i64, i, table_lines.len(), page_height) {
                if validate_table(&table, 0.1) {
                    elements.push(Element::Table(table));
                }
            }
        }

        for (i, _xobject) in image_xobjects(doc, *page_num).into_iter().enumerate() {
            elements.push(Element::Image(ImageElement {
                page_number: *page_num as i64,
                storage_ref: None,
                bbox: Some(estimate_paragraph_bbox(i, n.max(1), page_height)),
                caption: None,
            }));
        }
    }

    let _ = source_filename;
    Ok(elements)
}

async fn partition_ocr(
    bytes: &[u8],
    provider: &dyn OcrProvider,
    source_filename: &str,
) -> Result<Vec<Element>, CoreError> {
    let pages = render_pages_to_png(bytes)?;
    let mut elements = Vec::with_capacity(pages.len());
    for (page_number, png) in pages {
        let recognized = provider.recognize_page(page_number, &png).await?;
        for (i, paragraph) in recognized
            .text
            .split("\n\n")
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .enumerate()
        {
            elements.push(Element::Text(TextElement {
                page_number,
                text: paragraph.to_string(),
                role: infer_role(paragraph, 60),
                bbox: Some(estimate_paragraph_bbox(i, 10, 792.0)),
                font_size: None,
                section_title: None,
            }));
        }
    }
    let _ = source_filename;
    Ok(elements)
}

fn estimate_median_line_length(doc: &lopdf::Document, pages: &BTreeMap<u32, (u32, u16)>) -> usize {
    let mut lengths: Vec<usize> = pages
        .keys()
        .take(SAMPLE_PAGES)
        .flat_map(|p| {
            doc.extract_text(&[*p])
                .unwrap_or_default()
                .lines()
                .map(|l| l.len())
                .collect::<Vec<_>>()
        })
        .filter(|l| *l > 0)
        .collect();
    lengths.sort_unstable();
    lengths.get(lengths.len() / 2).copied().unwrap_or(60)
}

fn page_media_box_height(doc: &lopdf::Document, page_num: u32) -> Option<f64> {
    let page_id = *doc.get_pages().get(&page_num)?;
    let page = doc.get_dictionary(page_id).ok()?;
    let media_box = page.get(b"MediaBox").ok()?.as_array().ok()?;
    let y1 = media_box.get(3)?.as_float().unwrap_or(792.0);
    let y0 = media_box.first()?.as_float().unwrap_or(0.0);
    Some((y1 - y0) as f64)
}

fn image_xobjects(doc: &lopdf::Document, page_num: u32) -> Vec<lopdf::ObjectId> {
    let Some(page_id) = doc.get_pages().get(&page_num).copied() else {
        return Vec::new();
    };
    let Ok(dict) = doc.get_dictionary(page_id) else {
        return Vec::new();
    };
    let Ok(resources) = dict.get(b"Resources").and_then(|r| doc.dereference(r)) else {
        return Vec::new();
    };
    let Some(resources_dict) = resources.1.as_dict().ok() else {
        return Vec::new();
    };
    let Ok(xobjects) = resources_dict.get(b"XObject").and_then(|x| doc.dereference(x)) else {
        return Vec::new();
    };
    let Some(xobject_dict) = xobjects.1.as_dict().ok() else {
        return Vec::new();
    };
    xobject_dict
        .iter()
        .filter_map(|(_, v)| v.as_reference().ok())
        .collect()
}

/// Proportional vertical split used both for paragraph placement during
/// native partitioning and for element-to-chunk bbox propagation (C9):
/// `y0' = h·i/n`, `y1' = h·(i+1)/n`, full page width.
fn estimate_paragraph_bbox(index: usize, total: usize, page_height: f64) -> Bbox {
    let total = total.max(1) as f64;
    let y0 = page_height * (1.0 - (index as f64 + 1.0) / total);
    let y1 = page_height * (1.0 - index as f64 / total);
    [0.0, y0, 612.0, y1]
}

fn infer_role(text: &str, median_line_len: usize) -> TextRole {
    let trimmed = text.trim();
    let is_numbered = trimmed
        .split_once(|c: char| c == ' ' || c == '.')
        .map(|(prefix, _)| prefix.chars().all(|c| c.is_ascii_digit()) && !prefix.is_empty())
        .unwrap_or(false);
    let caps_ratio = caps_ratio(trimmed);

    if trimmed.len() < median_line_len && (caps_ratio > 0.6 || is_numbered) && !trimmed.contains('\n') {
        TextRole::Title
    } else if trimmed.starts_with('-') || trimmed.starts_with('•') || is_numbered {
        TextRole::ListItem
    } else {
        TextRole::NarrativeText
    }
}

fn caps_ratio(s: &str) -> f64 {
    let letters: Vec<char> = s.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return 0.0;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper as f64 / letters.len() as f64
}

fn looks_tabular(paragraph: &str) -> bool {
    let lines: Vec<&str> = paragraph.lines().collect();
    if lines.len() < 2 {
        return false;
    }
    let multi_column_lines = lines
        .iter()
        .filter(|l| split_columns(l).len() >= 2)
        .count();
    multi_column_lines as f64 / lines.len() as f64 > 0.6
}

fn split_columns(line: &str) -> Vec<&str> {
    line.split("  ").map(|c| c.trim()).filter(|c| !c.is_empty()).collect()
}

fn parse_table(
    raw: &str,
    page_number: i64,
    index: usize,
    total: usize,
    page_height: f64,
) -> Option<TableElement> {
    let rows: Vec<Vec<String>> = raw
        .lines()
        .map(|l| split_columns(l).into_iter().map(|c| c.to_string()).collect())
        .filter(|r: &Vec<String>| !r.is_empty())
        .collect();
    if rows.is_empty() {
        return None;
    }
    let col_count = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    Some(TableElement {
        page_number,
        bbox: Some(estimate_paragraph_bbox(index, total, page_height)),
        confidence: 0.75,
        caption: None,
        rows: rows.into_iter().map(|mut r| {
            r.resize(col_count, String::new());
            r
        }).collect(),
    })
}

/// Table validation of §4.6: discard on oversized cells, too many columns,
/// high repeated-content ratio, drawing-heavy pages, or low confidence.
pub fn validate_table(table: &TableElement, page_image_area_ratio: f64) -> bool {
    let col_count = table.rows.iter().map(|r| r.len()).max().unwrap_or(0);
    if col_count > 20 {
        return false;
    }
    if table.rows.iter().flatten().any(|cell| cell.len() > 5000) {
        return false;
    }
    if page_image_area_ratio > 0.6 {
        return false;
    }
    if table.confidence < 0.3 {
        return false;
    }

    let total_cells: usize = table.rows.iter().map(|r| r.len()).sum();
    if total_cells > 0 {
        let mut seen = std::collections::HashMap::new();
        for cell in table.rows.iter().flatten() {
            *seen.entry(cell.as_str()).or_insert(0usize) += 1;
        }
        let duplicates: usize = seen.values().filter(|&&c| c > 1).map(|&c| c - 1).sum();
        if duplicates as f64 / total_cells as f64 > 0.7 {
            return false;
        }
    }

    true
}

/// Renders pages to PNG for the OCR path and for full-page extraction.
/// Requires the `pdfium` feature; without it, callers get a clear error
/// rather than a silent no-op.
#[cfg(feature = "pdfium")]
fn render_pages_to_png(bytes: &[u8]) -> Result<Vec<(i64, Vec<u8>)>, CoreError> {
    use pdfium_render::prelude::*;

    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| CoreError::Partition {
            kind: StepErrorKind::Unreadable,
            message: e.to_string(),
        })?;

    let render_config = PdfRenderConfig::new().set_target_width(1600);
    let mut pages = Vec::new();
    for (i, page) in document.pages().iter().enumerate() {
        let bitmap = page.render_with_config(&render_config).map_err(|e| CoreError::Partition {
            kind: StepErrorKind::VendorError,
            message: e.to_string(),
        })?;
        let mut png_bytes = Vec::new();
        bitmap
            .as_image()
            .to_rgb8()
            .write_to(&mut std::io::Cursor::new(&mut png_bytes), image::ImageFormat::Png)
            .map_err(|e| CoreError::Partition {
                kind: StepErrorKind::VendorError,
                message: e.to_string(),
            })?;
        pages.push((i as i64 + 1, png_bytes));
    }
    Ok(pages)
}

#[cfg(not(feature = "pdfium"))]
fn render_pages_to_png(_bytes: &[u8]) -> Result<Vec<(i64, Vec<u8>)>, CoreError> {
    Err(CoreError::Partition {
        kind: StepErrorKind::VendorError,
        message: "page rasterization requires the `pdfium` feature".to_string(),
    })
}

/// Attaches `FullPageElement`s for pages classified complex enough to
/// warrant rasterization, uploading the render to C3. Non-fatal: if
/// rasterization is unavailable, the document simply carries no
/// full-page renders.
async fn capture_full_page_renders(
    elements: Vec<Element>,
    bytes: &[u8],
    object_store: &ObjectStore,
    run_id: &str,
) -> Result<Vec<Element>, CoreError> {
    let complex_pages: Vec<i64> = elements
        .iter()
        .filter(|e| matches!(e, Element::Image(_) | Element::Table(_)))
        .map(|e| e.page_number())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    if complex_pages.is_empty() {
        return Ok(elements);
    }

    let mut elements = elements;
    if let Ok(rendered) = render_pages_to_png(bytes) {
        for (page_number, png) in rendered {
            if !complex_pages.contains(&page_number) {
                continue;
            }
            let image_id = crate::models::new_id();
            let path = crate::object_store::storage_path(crate::object_store::StoragePathKind::EmailImage {
                run_id,
                image_id: &image_id,
            });
            if object_store.put_elevated(&path, &png).await.is_ok() {
                elements.push(Element::FullPage(FullPageElement {
                    page_number,
                    storage_ref: path,
                    dpi: PageComplexity::Complex.raster_dpi(),
                    bbox: None,
                }));
            }
        }
    }
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_detected_for_short_caps_line() {
        assert_eq!(infer_role("PROJECT OVERVIEW", 60), TextRole::Title);
    }

    #[test]
    fn list_item_detected_for_dash_prefix() {
        assert_eq!(infer_role("- install anchors per drawing A.1", 60), TextRole::ListItem);
    }

    #[test]
    fn narrative_text_is_default() {
        assert_eq!(
            infer_role("The foundation shall be poured according to the structural drawings.", 60),
            TextRole::NarrativeText
        );
    }

    #[test]
    fn paragraph_bbox_spans_full_page_height_in_order() {
        let first = estimate_paragraph_bbox(0, 4, 800.0);
        let last = estimate_paragraph_bbox(3, 4, 800.0);
        assert!(first[1] > last[1]);
        assert_eq!(first[3], 800.0);
        assert_eq!(last[1], 0.0);
    }

    #[test]
    fn table_rejected_when_columns_exceed_twenty() {
        let table = TableElement {
            page_number: 1,
            rows: vec![vec![String::new(); 21]],
            bbox: None,
            confidence: 0.9,
            caption: None,
        };
        assert!(!validate_table(&table, 0.0));
    }

    #[test]
    fn table_rejected_on_drawing_heavy_page() {
        let table = TableElement {
            page_number: 1,
            rows: vec![vec!["a".to_string(), "b".to_string()]],
            bbox: None,
            confidence: 0.9,
            caption: None,
        };
        assert!(!validate_table(&table, 0.8));
    }

    #[test]
    fn table_rejected_below_confidence_floor() {
        let table = TableElement {
            page_number: 1,
            rows: vec![vec!["a".to_string()]],
            bbox: None,
            confidence: 0.1,
            caption: None,
        };
        assert!(!validate_table(&table, 0.0));
    }

    #[test]
    fn looks_tabular_detects_multi_column_rows() {
        let text = "Item  Qty  Unit\nBolt  10  pcs\nNut  10  pcs";
        assert!(looks_tabular(text));
    }
}
