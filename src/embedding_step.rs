//! Embedding Step (C10): token-aware batched embedding over a run's
//! unembedded chunks, resuming safely after partial failure.
//!
//! Batch sizing and the retry/backoff contract live in the LLM Client
//! (C15); this step only owns batch construction and the resume query
//! against C2, delegating to `LlmClient::embed` rather than
//! re-implementing retry itself.

use crate::error::{CoreError, StepErrorKind};
use crate::llm_client::LlmClient;
use crate::models::{Chunk, EMBEDDING_DIMS};
use crate::store::SqliteStore;

const MAX_TEXTS_PER_BATCH: usize = 100;
const MAX_TOKENS_PER_BATCH: usize = 90_000;
/// Rough chars-per-token estimate used for batch sizing only; exactness is
/// the embedding provider's concern, not this step's.
const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct EmbeddingSummary {
    pub embedded: i64,
    pub skipped_already_embedded: i64,
}

fn estimated_tokens(text: &str) -> usize {
    (text.len() / CHARS_PER_TOKEN_ESTIMATE).max(1)
}

/// Packs chunks into batches that respect both the text-count and
/// estimated-token caps.
fn build_batches(chunks: &[Chunk]) -> Vec<Vec<&Chunk>> {
    let mut batches = Vec::new();
    let mut current: Vec<&Chunk> = Vec::new();
    let mut current_tokens = 0usize;

    for chunk in chunks {
        let tokens = estimated_tokens(&chunk.content);
        let would_overflow = current.len() >= MAX_TEXTS_PER_BATCH
            || (!current.is_empty() && current_tokens + tokens > MAX_TOKENS_PER_BATCH);
        if would_overflow {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(chunk);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Runs the embedding step for a run: queries C2 for chunks still missing
/// an embedding, batches them, and upserts results as each batch completes.
pub async fn run_embedding_step(
    store: &SqliteStore,
    llm: &LlmClient,
    request_id: &str,
    run_id: &str,
    embedding_model: &str,
) -> Result<EmbeddingSummary, CoreError> {
    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE run_id = ?")
        .bind(run_id)
        .fetch_one(store.pool())
        .await?;
    let pending = store.get_chunks_without_embedding(run_id).await?;
    let skipped = total_chunks - pending.len() as i64;

    if pending.is_empty() {
        return Ok(EmbeddingSummary {
            embedded: 0,
            skipped_already_embedded: skipped,
        });
    }

    let batches = build_batches(&pending);
    let mut embedded = 0i64;

    for batch in batches {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let vectors = llm.embed(request_id, embedding_model, &texts).await?;

        if vectors.len() != batch.len() {
            return Err(CoreError::Embedding {
                kind: StepErrorKind::VendorError,
                message: format!(
                    "embedding response count {} does not match batch size {}",
                    vectors.len(),
                    batch.len()
                ),
            });
        }

        for (chunk, vector) in batch.iter().zip(vectors.iter()) {
            if vector.len() != EMBEDDING_DIMS {
                return Err(CoreError::Embedding {
                    kind: StepErrorKind::DimensionMismatch,
                    message: format!(
                        "chunk {} got {}-dim vector, expected {EMBEDDING_DIMS}",
                        chunk.id,
                        vector.len()
                    ),
                });
            }
        }

        for (chunk, vector) in batch.iter().zip(vectors.iter()) {
            store.upsert_chunk_embedding(&chunk.id, run_id, vector).await?;
            embedded += 1;
        }
    }

    Ok(EmbeddingSummary {
        embedded,
        skipped_already_embedded: skipped as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use chrono::Utc;

    fn chunk_of_len(id: &str, len: usize) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "doc1".to_string(),
            run_id: "run1".to_string(),
            chunk_index: 0,
            content: "a".repeat(len),
            embedding: None,
            metadata: ChunkMetadata {
                page_number: 1,
                section_title: None,
                bbox: None,
                bbox_confidence: None,
                bbox_multi_page: None,
                element_category: "narrative_text".to_string(),
                source_filename: "spec.pdf".to_string(),
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn batches_respect_text_count_cap() {
        let chunks: Vec<Chunk> = (0..150).map(|i| chunk_of_len(&format!("c{i}"), 10)).collect();
        let batches = build_batches(&chunks);
        assert!(batches.iter().all(|b| b.len() <= MAX_TEXTS_PER_BATCH));
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 150);
    }

    #[test]
    fn batches_respect_token_cap() {
        let chunks: Vec<Chunk> = (0..3).map(|i| chunk_of_len(&format!("c{i}"), 200_000)).collect();
        let batches = build_batches(&chunks);
        assert_eq!(batches.len(), 3, "each oversized chunk should get its own batch");
    }

    #[test]
    fn estimated_tokens_is_never_zero() {
        assert!(estimated_tokens("") >= 1);
    }
}
