//! Metadata Step (C7): derives section hierarchy, page complexity, and
//! dominant-language annotations from a document's `Element[]`.
//!
//! Failure here is non-fatal per §4.7: an outline that can't be derived
//! comes back empty, with the step still marked `completed` and a warning
//! count recorded in `summary_stats`.

use std::collections::HashMap;

use crate::models::{Element, TextRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageComplexityClass {
    TextOnly,
    Simple,
    Complex,
    Fragmented,
}

impl PageComplexityClass {
    fn as_str(self) -> &'static str {
        match self {
            PageComplexityClass::TextOnly => "text_only",
            PageComplexityClass::Simple => "simple",
            PageComplexityClass::Complex => "complex",
            PageComplexityClass::Fragmented => "fragmented",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageMetadata {
    pub page_number: i64,
    pub complexity: PageComplexityClass,
    pub dominant_language: String,
}

#[derive(Debug, Clone)]
pub struct SectionNode {
    pub title: String,
    pub page_number: i64,
    pub level: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataOutput {
    pub outline: Vec<SectionNode>,
    pub pages: Vec<PageMetadata>,
    /// Per-element section title, indexed the same as the input `Element[]`.
    pub element_sections: Vec<Option<String>>,
    pub warning_count: i64,
}

/// Numbered-prefix patterns recognized as section headers, e.g. `1`,
/// `1.2`, `A.1`. Level is the prefix's dot-count (0-indexed).
fn numbered_prefix_level(text: &str) -> Option<usize> {
    let prefix = text.trim().split_whitespace().next()?;
    let prefix = prefix.trim_end_matches('.');
    if prefix.is_empty() {
        return None;
    }
    let parts: Vec<&str> = prefix.split('.').collect();
    let all_valid = parts.iter().all(|p| {
        !p.is_empty() && (p.chars().all(|c| c.is_ascii_digit()) || (p.len() <= 2 && p.chars().all(|c| c.is_ascii_alphabetic())))
    });
    if all_valid && parts.len() <= 4 {
        Some(parts.len() - 1)
    } else {
        None
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

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted[sorted.len() / 2]
}

/// Derives the section hierarchy: explicit numbered prefixes take
/// precedence; otherwise a title-role element with font size ≥ 1.3× the
/// document's median font size and a high capitalization ratio qualifies.
fn derive_outline(elements: &[Element]) -> (Vec<SectionNode>, Vec<Option<String>>) {
    let font_sizes: Vec<f64> = elements
        .iter()
        .filter_map(|e| match e {
            Element::Text(t) => t.font_size,
            _ => None,
        })
        .collect();
    let median_font = median(&font_sizes);

    let mut outline = Vec::new();
    let mut element_sections = Vec::with_capacity(elements.len());
    let mut current_title: Option<String> = None;

    for element in elements {
        let Element::Text(text_element) = element else {
            element_sections.push(current_title.clone());
            continue;
        };

        let is_heading = if let Some(level) = numbered_prefix_level(&text_element.text) {
            outline.push(SectionNode {
                title: text_element.text.trim().to_string(),
                page_number: text_element.page_number,
                level,
            });
            true
        } else if text_element.role == TextRole::Title {
            let large_enough = text_element
                .font_size
                .map(|f| median_font > 0.0 && f >= median_font * 1.3)
                .unwrap_or(false);
            if large_enough && caps_ratio(&text_element.text) > 0.5 {
                outline.push(SectionNode {
                    title: text_element.text.trim().to_string(),
                    page_number: text_element.page_number,
                    level: 0,
                });
                true
            } else {
                false
            }
        } else {
            false
        };

        if is_heading {
            current_title = Some(text_element.text.trim().to_string());
        }
        element_sections.push(current_title.clone());
    }

    (outline, element_sections)
}

fn classify_page(
    text_chars: usize,
    table_count: usize,
    image_count: usize,
    fullpage_count: usize,
) -> PageComplexityClass {
    if fullpage_count > 0 && text_chars < 50 {
        return PageComplexityClass::Fragmented;
    }
    if table_count == 0 && image_count == 0 {
        PageComplexityClass::TextOnly
    } else if table_count + image_count <= 2 {
        PageComplexityClass::Simple
    } else {
        PageComplexityClass::Complex
    }
}

/// Danish-tuned heuristic language detector. Scores Danish-specific
/// characters and a small stopword set against an English stopword set,
/// falling back to `"da"` on a tie since the corpus this pipeline serves is
/// construction documentation localized for the Danish market (§1).
fn detect_language(text: &str) -> String {
    const DANISH_STOPWORDS: [&str; 10] = [
        "og", "ikke", "det", "at", "som", "er", "for", "på", "med", "til",
    ];
    const ENGLISH_STOPWORDS: [&str; 10] = [
        "the", "and", "is", "for", "with", "that", "this", "of", "to", "in",
    ];

    let lower = text.to_lowercase();
    let has_danish_chars = lower.chars().any(|c| matches!(c, 'æ' | 'ø' | 'å'));

    let words: Vec<&str> = lower.split_whitespace().collect();
    if words.is_empty() {
        return "da".to_string();
    }

    let danish_hits = words.iter().filter(|w| DANISH_STOPWORDS.contains(w)).count();
    let english_hits = words.iter().filter(|w| ENGLISH_STOPWORDS.contains(w)).count();

    if has_danish_chars || danish_hits >= english_hits {
        "da".to_string()
    } else {
        "en".to_string()
    }
}

/// Runs the metadata step over a document's partitioned elements.
pub fn run_metadata_step(elements: &[Element]) -> MetadataOutput {
    let (outline, element_sections) = derive_outline(elements);

    let mut per_page: HashMap<i64, (usize, usize, usize, usize, String)> = HashMap::new();
    for element in elements {
        let page = element.page_number();
        let entry = per_page.entry(page).or_insert((0, 0, 0, 0, String::new()));
        match element {
            Element::Text(t) => {
                entry.0 += t.text.len();
                entry.4.push(' ');
                entry.4.push_str(&t.text);
            }
            Element::Table(_) => entry.1 += 1,
            Element::Image(_) => entry.2 += 1,
            Element::FullPage(_) => entry.3 += 1,
        }
    }

    let doc_language = {
        let all_text: String = elements
            .iter()
            .filter_map(|e| match e {
                Element::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ");
        detect_language(&all_text)
    };

    let mut pages: Vec<PageMetadata> = per_page
        .into_iter()
        .map(|(page_number, (chars, tables, images, fullpages, page_text))| {
            let language = if page_text.trim().is_empty() {
                doc_language.clone()
            } else {
                detect_language(&page_text)
            };
            PageMetadata {
                page_number,
                complexity: classify_page(chars, tables, images, fullpages),
                dominant_language: language,
            }
        })
        .collect();
    pages.sort_by_key(|p| p.page_number);

    let warning_count = if outline.is_empty() { 1 } else { 0 };

    MetadataOutput {
        outline,
        pages,
        element_sections,
        warning_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextElement;

    fn text(text: &str, role: TextRole, font_size: Option<f64>, page: i64) -> Element {
        Element::Text(TextElement {
            page_number: page,
            text: text.to_string(),
            role,
            bbox: None,
            font_size,
            section_title: None,
        })
    }

    #[test]
    fn numbered_prefix_detects_levels() {
        assert_eq!(numbered_prefix_level("1 Introduction"), Some(0));
        assert_eq!(numbered_prefix_level("1.2 Scope"), Some(1));
        assert_eq!(numbered_prefix_level("A.1 Appendix"), Some(1));
        assert_eq!(numbered_prefix_level("Not a heading at all"), None);
    }

    #[test]
    fn outline_picks_up_numbered_and_styled_headings() {
        let elements = vec![
            text("1 FOUNDATION WORKS", TextRole::Title, Some(16.0), 1),
            text("Concrete shall meet strength class C30/37.", TextRole::NarrativeText, Some(10.0), 1),
            text("1.1 Excavation", TextRole::Title, Some(14.0), 2),
        ];
        let (outline, sections) = derive_outline(&elements);
        assert_eq!(outline.len(), 2);
        assert_eq!(sections[1], Some("1 FOUNDATION WORKS".to_string()));
        assert_eq!(sections[2], Some("1.1 Excavation".to_string()));
    }

    #[test]
    fn page_classification_text_only_when_no_visual_elements() {
        assert_eq!(classify_page(500, 0, 0, 0), PageComplexityClass::TextOnly);
    }

    #[test]
    fn page_classification_complex_with_many_visuals() {
        assert_eq!(classify_page(500, 2, 2, 0), PageComplexityClass::Complex);
    }

    #[test]
    fn language_detection_favors_danish_on_special_characters() {
        assert_eq!(detect_language("Fundamentet skal udføres i henhold til tegningerne."), "da");
    }

    #[test]
    fn language_detection_falls_back_to_english() {
        assert_eq!(
            detect_language("The foundation shall be constructed according to the drawings."),
            "en"
        );
    }

    #[test]
    fn empty_outline_is_non_fatal_with_warning() {
        let elements = vec![text("Just some narrative text.", TextRole::NarrativeText, Some(10.0), 1)];
        let output = run_metadata_step(&elements);
        assert!(output.outline.is_empty());
        assert_eq!(output.warning_count, 1);
    }
}
