//! Enrichment Step (C8): vision captions for image and table elements.
//!
//! Captions are generated through the LLM Client (C15) and folded back into
//! the element so the chunker (C9) can prepend them to chunk content. Batch
//! dispatch bounds concurrency at 5 in-flight calls rather than chunking the
//! HTTP payload itself, since captioning is one image per request.

use futures::stream::{self, StreamExt};
use rand::Rng;
use std::time::Duration;

use crate::error::{CoreError, StepErrorKind};
use crate::llm_client::{classify_embedding_failure, LlmClient};
use crate::models::Element;

const BATCH_CONCURRENCY: usize = 5;
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const ITEM_TIMEOUT: Duration = Duration::from_secs(60);
const FAILURE_RATIO_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Default)]
pub struct EnrichmentSummary {
    pub total: i64,
    pub captioned: i64,
    pub failed: i64,
}

/// Runs vision captioning over every image/table element in place.
/// `image_bytes` resolves an element's storage reference to its raw bytes
/// (injected so the step stays independent of the object store's access
/// scoping).
pub async fn run_enrichment_step<F, Fut>(
    elements: &mut [Element],
    llm: &LlmClient,
    request_id: &str,
    document_language: &str,
    load_image: F,
) -> Result<EnrichmentSummary, CoreError>
where
    F: Fn(&str) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<u8>, CoreError>> + Send,
{
    let targets: Vec<usize> = elements
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            Element::Image(img) if img.storage_ref.is_some() => Some(i),
            Element::Table(_) => Some(i),
            _ => None,
        })
        .collect();

    if targets.is_empty() {
        return Ok(EnrichmentSummary::default());
    }

    let prompt = caption_prompt(document_language);

    let results: Vec<(usize, Result<String, CoreError>)> = stream::iter(targets.into_iter())
        .map(|index| {
            let prompt = prompt.clone();
            let element = &elements[index];
            let payload = match element {
                Element::Image(img) => img.storage_ref.clone(),
                Element::Table(table) => Some(render_table_as_text(table)),
                _ => None,
            };
            let load_image = &load_image;
            async move {
                let outcome = caption_one(llm, request_id, &prompt, element, payload, load_image).await;
                (index, outcome)
            }
        })
        .buffer_unordered(BATCH_CONCURRENCY)
        .collect()
        .await;

    let mut summary = EnrichmentSummary {
        total: results.len() as i64,
        ..Default::default()
    };

    for (index, outcome) in results {
        match outcome {
            Ok(caption) => {
                summary.captioned += 1;
                apply_caption(&mut elements[index], caption);
            }
            Err(CoreError::Enrichment { kind: StepErrorKind::RateLimited, message }) => {
                return Err(CoreError::Enrichment {
                    kind: StepErrorKind::RateLimited,
                    message,
                });
            }
            Err(_) => {
                summary.failed += 1;
            }
        }
    }

    let failure_ratio = summary.failed as f64 / summary.total.max(1) as f64;
    if failure_ratio > FAILURE_RATIO_THRESHOLD {
        return Err(CoreError::Enrichment {
            kind: StepErrorKind::VendorError,
            message: format!(
                "enrichment failure ratio {failure_ratio:.2} exceeds threshold ({} of {} items failed)",
                summary.failed, summary.total
            ),
        });
    }

    Ok(summary)
}

async fn caption_one<F, Fut>(
    llm: &LlmClient,
    request_id: &str,
    prompt: &str,
    element: &Element,
    payload: Option<String>,
    load_image: &F,
) -> Result<String, CoreError>
where
    F: Fn(&str) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>, CoreError>>,
{
    // Tables are captioned from their rendered text rather than an image.
    if let Element::Table(_) = element {
        let table_text = payload.unwrap_or_default();
        return caption_with_retry(llm, request_id, &format!("{prompt}\n\n{table_text}"), None, load_image).await;
    }

    let storage_ref = payload.ok_or_else(|| CoreError::Enrichment {
        kind: StepErrorKind::NoContent,
        message: "image element missing storage_ref".to_string(),
    })?;
    caption_with_retry(llm, request_id, prompt, Some(storage_ref), load_image).await
}

async fn caption_with_retry<F, Fut>(
    llm: &LlmClient,
    request_id: &str,
    prompt: &str,
    storage_ref: Option<String>,
    load_image: &F,
) -> Result<String, CoreError>
where
    F: Fn(&str) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>, CoreError>>,
{
    let mut last_err: Option<CoreError> = None;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        let call = async {
            match &storage_ref {
                Some(path) => {
                    let bytes = load_image(path).await?;
                    use base64::Engine;
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    llm.caption_image(request_id, prompt, &encoded, "image/png").await
                }
                None => llm.chat(request_id, &[crate::llm_client::ChatMessage::user(prompt.to_string())]).await,
            }
        };

        match tokio::time::timeout(ITEM_TIMEOUT, call).await {
            Ok(Ok(caption)) => return Ok(caption),
            Ok(Err(e)) => {
                let kind = classify_embedding_failure(&e);
                last_err = Some(CoreError::Enrichment {
                    kind,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                last_err = Some(CoreError::Enrichment {
                    kind: StepErrorKind::Timeout,
                    message: "caption request timed out".to_string(),
                });
            }
        }
    }

    Err(last_err.unwrap_or(CoreError::Enrichment {
        kind: StepErrorKind::VendorError,
        message: "caption request failed after retries".to_string(),
    }))
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.pow(attempt - 1);
    let capped = base.min(BACKOFF_CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    capped + Duration::from_millis(jitter_ms)
}

fn caption_prompt(document_language: &str) -> String {
    format!(
        "You are captioning a figure or table from a construction technical document. \
         Describe its content precisely and concisely, preserving any measurements, \
         material callouts, or code references verbatim. Respond in {document_language}."
    )
}

fn render_table_as_text(table: &crate::models::TableElement) -> String {
    table
        .rows
        .iter()
        .map(|row| row.join(" | "))
        .collect::<Vec<_>>()
        .join("\n")
}

fn apply_caption(element: &mut Element, caption: String) {
    match element {
        Element::Image(img) => img.caption = Some(caption),
        Element::Table(table) => table.caption = Some(caption),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TableElement;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let d1 = backoff_delay(1);
        let d2 = backoff_delay(2);
        assert!(d1.as_millis() >= 1000 && d1.as_millis() < 1250);
        assert!(d2.as_millis() >= 2000 && d2.as_millis() < 2250);
        let d_big = backoff_delay(10);
        assert!(d_big.as_millis() <= BACKOFF_CAP.as_millis() + 250);
    }

    #[test]
    fn table_rendered_as_pipe_delimited_text() {
        let table = TableElement {
            page_number: 1,
            rows: vec![
                vec!["Item".to_string(), "Qty".to_string()],
                vec!["Bolt".to_string(), "10".to_string()],
            ],
            bbox: None,
            confidence: 0.9,
            caption: None,
        };
        let rendered = render_table_as_text(&table);
        assert_eq!(rendered, "Item | Qty\nBolt | 10");
    }

    #[test]
    fn apply_caption_sets_image_caption() {
        let mut element = Element::Image(crate::models::ImageElement {
            page_number: 1,
            storage_ref: Some("path.png".to_string()),
            bbox: None,
            caption: None,
        });
        apply_caption(&mut element, "a steel beam connection detail".to_string());
        match element {
            Element::Image(img) => assert_eq!(img.caption.as_deref(), Some("a steel beam connection detail")),
            _ => panic!("expected image"),
        }
    }
}
