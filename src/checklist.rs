//! Checklist Analyzer (C14): parses a free-text audit checklist, retrieves
//! supporting evidence per item via C11, and classifies each item's status
//! with source attribution.

use std::collections::HashSet;

use crate::context::RequestContext;
use crate::error::CoreError;
use crate::llm_client::{ChatMessage, LlmClient};
use crate::models::{
    new_id, ChecklistAnalysisRun, ChecklistResult, ChecklistRunStatus, ChecklistSource,
    ChecklistStatus, SearchResultRef,
};
use crate::retrieval::{self, RetrievalRequest};
use crate::store::SqliteStore;

#[derive(Debug, serde::Deserialize)]
struct ParsedItem {
    item_number: i64,
    item_name: String,
    #[serde(default)]
    queries: Vec<String>,
}

async fn parse_checklist(
    llm: &LlmClient,
    request_id: &str,
    checklist_content: &str,
) -> Result<Vec<ParsedItem>, CoreError> {
    let prompt = format!(
        "Parse the following audit checklist into a JSON array of items, each with \
         `item_number` (integer), `item_name` (string), and `queries` (an array of 1-3 \
         retrieval queries that would find evidence for this item in project documentation). \
         Return only the JSON array.\n\nChecklist:\n{checklist_content}"
    );
    let response = llm.chat(request_id, &[ChatMessage::user(prompt)]).await?;
    let start = response.find('[').unwrap_or(0);
    let end = response.rfind(']').map(|i| i + 1).unwrap_or(response.len());
    serde_json::from_str(&response[start..end])
        .map_err(|e| CoreError::Generation(format!("checklist parse response was not valid JSON: {e}")))
}

async fn retrieve_for_item(
    store: &SqliteStore,
    llm: &LlmClient,
    request_id: &str,
    embedding_model: &str,
    run_id: &str,
    queries: &[String],
    ctx: &RequestContext,
) -> Result<Vec<SearchResultRef>, CoreError> {
    let mut seen = HashSet::new();
    let mut evidence = Vec::new();
    for query in queries {
        let outcome = retrieval::retrieve(
            store,
            llm,
            request_id,
            embedding_model,
            RetrievalRequest {
                query_text: query,
                run_id,
                top_k: Some(5),
            },
            ctx,
        )
        .await?;
        for result in outcome.results {
            if seen.insert(result.chunk_id.clone()) {
                evidence.push(result);
            }
        }
    }
    Ok(evidence)
}

fn parse_status(raw: &str) -> ChecklistStatus {
    match raw.trim().to_lowercase().as_str() {
        "found" => ChecklistStatus::Found,
        "missing" => ChecklistStatus::Missing,
        "risk" => ChecklistStatus::Risk,
        "conditions" => ChecklistStatus::Conditions,
        _ => ChecklistStatus::PendingClarification,
    }
}

#[derive(serde::Deserialize)]
struct RawResult {
    item_number: i64,
    item_name: String,
    status: String,
    description: String,
    #[serde(default)]
    confidence_score: Option<f64>,
    #[serde(default)]
    sources: Vec<RawSource>,
}

#[derive(serde::Deserialize)]
struct RawSource {
    document: String,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    excerpt: Option<String>,
}

async fn structure_results(
    llm: &LlmClient,
    request_id: &str,
    analysis_run_id: &str,
    raw_output: &str,
) -> Result<Vec<ChecklistResult>, CoreError> {
    let prompt = format!(
        "Convert the following narrative checklist analysis into a strict JSON array. Each \
         element must have: `item_number` (integer), `item_name` (string), `status` (one of \
         found, missing, risk, conditions, pending_clarification), `description` (string), \
         `confidence_score` (0.0-1.0 or null), and `sources` (array of {{document, page, \
         excerpt}}). Return only the JSON array.\n\nAnalysis:\n{raw_output}"
    );
    let response = llm.chat(request_id, &[ChatMessage::user(prompt)]).await?;
    let start = response.find('[').unwrap_or(0);
    let end = response.rfind(']').map(|i| i + 1).unwrap_or(response.len());
    let raw: Vec<RawResult> = serde_json::from_str(&response[start..end])
        .map_err(|e| CoreError::Generation(format!("checklist structuring response was not valid JSON: {e}")))?;

    Ok(raw
        .into_iter()
        .map(|r| {
            let all_sources: Vec<ChecklistSource> = r
                .sources
                .into_iter()
                .map(|s| ChecklistSource {
                    document: s.document,
                    page: s.page,
                    excerpt: s.excerpt,
                })
                .collect();
            let primary = all_sources.first();
            ChecklistResult {
                id: new_id(),
                analysis_run_id: analysis_run_id.to_string(),
                item_number: r.item_number,
                item_name: r.item_name,
                status: parse_status(&r.status),
                description: r.description,
                confidence_score: r.confidence_score,
                source_document: primary.map(|s| s.document.clone()),
                source_page: primary.and_then(|s| s.page),
                source_excerpt: primary.and_then(|s| s.excerpt.clone()),
                all_sources,
            }
        })
        .collect())
}

/// Runs the full checklist analysis pipeline and persists progress/results
/// as it goes, so callers can poll `progress_current`/`progress_total`.
pub async fn analyze_checklist(
    store: &SqliteStore,
    llm: &LlmClient,
    request_id: &str,
    embedding_model: &str,
    indexing_run_id: &str,
    owner_id: Option<&str>,
    checklist_content: &str,
    model_name: &str,
    ctx: &RequestContext,
) -> Result<ChecklistAnalysisRun, CoreError> {
    store.get_run_scoped(indexing_run_id, ctx).await?;

    let items = parse_checklist(llm, request_id, checklist_content).await?;

    let mut run = ChecklistAnalysisRun {
        id: new_id(),
        indexing_run_id: indexing_run_id.to_string(),
        owner_id: owner_id.map(|s| s.to_string()),
        checklist_content: checklist_content.to_string(),
        model_name: model_name.to_string(),
        status: ChecklistRunStatus::Running,
        raw_output: None,
        results: Vec::new(),
        progress_current: 0,
        progress_total: items.len() as i64,
        error_message: None,
    };
    store.create_checklist_run(&run).await?;

    let mut evidence_by_item = Vec::new();
    for item in &items {
        let evidence = retrieve_for_item(
            store,
            llm,
            request_id,
            embedding_model,
            indexing_run_id,
            &item.queries,
            ctx,
        )
        .await?;
        evidence_by_item.push((item, evidence));
        run.progress_current += 1;
        store
            .update_checklist_run_progress(&run.id, run.progress_current, run.progress_total)
            .await?;
    }

    let analysis_context = evidence_by_item
        .iter()
        .map(|(item, evidence)| {
            let evidence_block = evidence
                .iter()
                .map(|e| format!("  - {} (p.{}): {}", e.source_filename, e.page_number.unwrap_or(0), e.content))
                .collect::<Vec<_>>()
                .join("\n");
            format!("Item {}: {}\n{}", item.item_number, item.item_name, evidence_block)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let analysis_prompt = format!(
        "Analyze each checklist item against its evidence below. For each item, state whether \
         it is addressed, missing, a risk, conditional, or needs clarification, with reasoning \
         citing the source documents.\n\n{analysis_context}"
    );
    let raw_output = llm.chat(request_id, &[ChatMessage::user(analysis_prompt)]).await?;
    run.raw_output = Some(raw_output.clone());

    let results = structure_results(llm, request_id, &run.id, &raw_output).await?;
    for result in &results {
        store.insert_checklist_result(result).await?;
    }
    run.results = results;
    run.status = ChecklistRunStatus::Completed;
    store
        .update_checklist_run_status(&run.id, ChecklistRunStatus::Completed, None)
        .await?;

    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_maps_known_values() {
        assert_eq!(parse_status("Found"), ChecklistStatus::Found);
        assert_eq!(parse_status("risk"), ChecklistStatus::Risk);
        assert_eq!(parse_status("unknown-thing"), ChecklistStatus::PendingClarification);
    }
}
