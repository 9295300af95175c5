//! Generation Engine (C12): assembles cited context from retrieval
//! results, synthesizes an answer, and persists a Query Run.

use std::collections::HashMap;
use std::time::Instant;

use crate::context::RequestContext;
use crate::error::CoreError;
use crate::llm_client::{ChatMessage, LlmClient};
use crate::models::{new_id, AccessLevel, QueryRun, SearchResultRef};
use crate::retrieval::{self, RetrievalRequest};
use crate::store::SqliteStore;

pub struct GenerationResult {
    pub answer: String,
    pub citations: Vec<SearchResultRef>,
    pub performance_metrics: serde_json::Value,
    pub step_timings: HashMap<String, f64>,
}

fn format_citation(index: usize, result: &SearchResultRef) -> String {
    let page = result
        .page_number
        .map(|p| format!(", p.{p}"))
        .unwrap_or_default();
    format!(
        "[{}] {}{}\n{}",
        index + 1,
        result.source_filename,
        page,
        result.content
    )
}

fn build_prompt(query_text: &str, context: &[SearchResultRef]) -> Vec<ChatMessage> {
    let context_block = context
        .iter()
        .enumerate()
        .map(|(i, r)| format_citation(i, r))
        .collect::<Vec<_>>()
        .join("\n\n");

    let system = ChatMessage::system(
        "You are a construction-documentation assistant. Answer strictly from the provided \
         context. Cite sources inline using their bracketed index, e.g. [1]. If the context \
         does not contain the answer, say so explicitly rather than guessing.",
    );
    let user = ChatMessage::user(format!(
        "Context:\n{context_block}\n\nQuestion: {query_text}\n\nAnswer with inline citations."
    ));
    vec![system, user]
}

/// Runs retrieval (C11) then generation (C12) end to end and persists the
/// resulting Query Run.
pub async fn answer_query(
    store: &SqliteStore,
    llm: &LlmClient,
    request_id: &str,
    embedding_model: &str,
    query_text: &str,
    run_id: &str,
    top_k: Option<i64>,
    ctx: &RequestContext,
) -> Result<GenerationResult, CoreError> {
    let mut step_timings = HashMap::new();

    let retrieval_started = Instant::now();
    let retrieval_outcome = retrieval::retrieve(
        store,
        llm,
        request_id,
        embedding_model,
        RetrievalRequest {
            query_text,
            run_id,
            top_k,
        },
        ctx,
    )
    .await?;
    step_timings.insert("retrieval".to_string(), retrieval_started.elapsed().as_secs_f64());

    let generation_started = Instant::now();
    let messages = build_prompt(query_text, &retrieval_outcome.results);
    let answer = llm.chat(request_id, &messages).await?;
    step_timings.insert("generation".to_string(), generation_started.elapsed().as_secs_f64());

    let performance_metrics = serde_json::json!({
        "variations_used": retrieval_outcome.variations.len(),
        "chunks_retrieved": retrieval_outcome.results.len(),
    });

    let query_run = QueryRun {
        id: new_id(),
        owner_id: ctx.owner_id.clone(),
        indexing_run_id: run_id.to_string(),
        query_text: query_text.to_string(),
        variations: retrieval_outcome.variations.clone(),
        search_results: retrieval_outcome.results.clone(),
        final_response: answer.clone(),
        step_timings: step_timings.clone(),
        performance_metrics: performance_metrics.clone(),
        access_level: AccessLevel::Owner,
        created_at: chrono::Utc::now(),
    };
    store.create_query_run(&query_run).await?;

    Ok(GenerationResult {
        answer,
        citations: retrieval_outcome.results,
        performance_metrics,
        step_timings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_includes_page_number_when_present() {
        let result = SearchResultRef {
            chunk_id: "c1".to_string(),
            content: "Concrete strength class C30/37.".to_string(),
            similarity_score: 0.9,
            source_filename: "structural-spec.pdf".to_string(),
            page_number: Some(12),
            bbox: None,
        };
        let citation = format_citation(0, &result);
        assert!(citation.starts_with("[1] structural-spec.pdf, p.12"));
    }

    #[test]
    fn citation_omits_page_when_absent() {
        let result = SearchResultRef {
            chunk_id: "c1".to_string(),
            content: "General notes.".to_string(),
            similarity_score: 0.5,
            source_filename: "notes.pdf".to_string(),
            page_number: None,
            bbox: None,
        };
        let citation = format_citation(0, &result);
        assert!(citation.starts_with("[1] notes.pdf\n"));
    }
}
