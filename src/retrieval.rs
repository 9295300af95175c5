//! Retrieval Engine (C11): query expansion, HyDE, multi-variation vector
//! search, dedup, and top-k truncation, access-scoped through C2's
//! `get_run_scoped`.

use futures::future::join_all;

use crate::context::RequestContext;
use crate::error::CoreError;
use crate::llm_client::{ChatMessage, LlmClient};
use crate::models::{SearchResultRef, EMBEDDING_DIMS};
use crate::store::SqliteStore;

pub const DEFAULT_TOP_K: i64 = 10;
pub const SIMILARITY_THRESHOLD: f64 = 0.3;
const MAX_VARIATIONS: usize = 3;
const DEDUP_PREFIX_CHARS: usize = 200;

pub struct RetrievalRequest<'a> {
    pub query_text: &'a str,
    pub run_id: &'a str,
    pub top_k: Option<i64>,
}

pub struct RetrievalOutcome {
    pub results: Vec<SearchResultRef>,
    pub variations: Vec<String>,
}

/// Asks C15 for up to `MAX_VARIATIONS` paraphrase/synonym/technical-term
/// variations of the query, plus a HyDE hypothetical-passage variation.
async fn expand_query(llm: &LlmClient, request_id: &str, query_text: &str) -> Vec<String> {
    let mut variations = vec![query_text.to_string()];

    let expansion_prompt = format!(
        "Generate up to {MAX_VARIATIONS} alternative phrasings of the following search query, \
         one per line, with no numbering: paraphrase it, expand synonyms, and substitute \
         technical-term equivalents where relevant for a construction document corpus.\n\nQuery: {query_text}"
    );
    if let Ok(response) = llm.chat(request_id, &[ChatMessage::user(expansion_prompt)]).await {
        variations.extend(
            response
                .lines()
                .map(|l| l.trim().trim_start_matches(['-', '*']).trim().to_string())
                .filter(|l| !l.is_empty())
                .take(MAX_VARIATIONS),
        );
    }

    let hyde_prompt = format!(
        "Write a short hypothetical passage, in the style of a construction technical \
         specification, that would directly answer this query. Do not mention that it is \
         hypothetical.\n\nQuery: {query_text}"
    );
    if let Ok(passage) = llm.chat(request_id, &[ChatMessage::user(hyde_prompt)]).await {
        variations.push(passage);
    }

    variations
}

fn dedup_key(content: &str) -> String {
    content.chars().take(DEDUP_PREFIX_CHARS).collect()
}

/// Runs the full retrieval pipeline for an access-scoped caller. Fails with
/// `CoreError::Authorization` before any retrieval work happens if the
/// caller cannot read the target run.
pub async fn retrieve(
    store: &SqliteStore,
    llm: &LlmClient,
    request_id: &str,
    embedding_model: &str,
    request: RetrievalRequest<'_>,
    ctx: &RequestContext,
) -> Result<RetrievalOutcome, CoreError> {
    store.get_run_scoped(request.run_id, ctx).await?;

    let top_k = request.top_k.unwrap_or(DEFAULT_TOP_K);
    let variations = expand_query(llm, request_id, request.query_text).await;

    let embeddings = llm.embed(request_id, embedding_model, &variations).await?;
    for embedding in &embeddings {
        if embedding.len() != EMBEDDING_DIMS {
            return Err(CoreError::Retrieval(format!(
                "query embedding has {} dims, expected {EMBEDDING_DIMS}",
                embedding.len()
            )));
        }
    }

    let run_id = request.run_id;
    let searches = embeddings.iter().map(|embedding| {
        store.match_chunks(embedding, SIMILARITY_THRESHOLD, top_k, Some(run_id), None)
    });
    let per_variation = join_all(searches).await;

    let mut best: std::collections::HashMap<String, SearchResultRef> = std::collections::HashMap::new();
    for outcome in per_variation {
        let matches = outcome?;
        for (chunk, similarity) in matches {
            let key = dedup_key(&chunk.content);
            let candidate = SearchResultRef {
                chunk_id: chunk.id,
                content: chunk.content,
                similarity_score: similarity,
                source_filename: chunk.metadata.source_filename,
                page_number: Some(chunk.metadata.page_number),
                bbox: chunk.metadata.bbox,
            };
            best.entry(key)
                .and_modify(|existing| {
                    if candidate.similarity_score > existing.similarity_score {
                        *existing = candidate.clone();
                    }
                })
                .or_insert(candidate);
        }
    }

    let mut results: Vec<SearchResultRef> = best.into_values().collect();
    results.sort_by(|a, b| b.similarity_score.partial_cmp(&a.similarity_score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(top_k.max(0) as usize);

    Ok(RetrievalOutcome { results, variations })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_uses_first_200_chars() {
        let long = "a".repeat(500);
        let key = dedup_key(&long);
        assert_eq!(key.len(), DEDUP_PREFIX_CHARS);
    }

    #[test]
    fn dedup_key_differs_for_distinct_prefixes() {
        assert_ne!(dedup_key("foundation details"), dedup_key("roofing details"));
    }
}
