//! Indexing Orchestrator (C5): drives the five-step per-document pipeline
//! over a batch, then a single run-wide batched embedding pass, with
//! bounded concurrency, step timeouts, and partial-success semantics.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::chunking;
use crate::embedding_step;
use crate::enrichment;
use crate::error::{CoreError, StepErrorKind};
use crate::llm_client::LlmClient;
use crate::metadata_step;
use crate::models::{DocumentInput, RunStatus, StepResult, UploadType};
use crate::object_store::ObjectStore;
use crate::ocr::OcrProvider;
use crate::partition;
use crate::store::SqliteStore;

pub const DEFAULT_MAX_CONCURRENT_DOCUMENTS: usize = 5;
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub struct OrchestratorConfig {
    pub max_concurrent_documents: usize,
    pub step_timeout: Duration,
    pub embedding_model: String,
    pub document_language_hint: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_documents: DEFAULT_MAX_CONCURRENT_DOCUMENTS,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            embedding_model: "voyage-multilingual-2".to_string(),
            document_language_hint: "da".to_string(),
        }
    }
}

pub struct IndexingOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub should_trigger_wiki: bool,
    pub upload_type: UploadType,
}

async fn with_timeout<T>(
    step: &str,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, CoreError>>,
) -> Result<T, CoreError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Chunking {
            kind: StepErrorKind::Timeout,
            message: format!("step '{step}' exceeded its wall-clock budget"),
        }),
    }
}

/// Runs `partition → metadata → enrichment → chunking` for one document.
/// Each step's `StepResult` is journaled as it completes; a failure stops
/// the chain for this document but does not affect siblings.
async fn run_document_pipeline(
    store: &SqliteStore,
    llm: &LlmClient,
    ocr: Option<&dyn OcrProvider>,
    object_store: &ObjectStore,
    config: &OrchestratorConfig,
    run_id: &str,
    input: &DocumentInput,
) -> Result<i64, CoreError> {
    let bytes = object_store.get_elevated(&input.storage_path).await?;

    // --- partition ---
    let started = StepResult::started("partition");
    let partition_result = with_timeout(
        "partition",
        config.step_timeout,
        partition::partition_document(&bytes, &input.filename, ocr, object_store, run_id),
    )
    .await;
    let partitioned = match partition_result {
        Ok(result) => {
            store.set_document_page_count(&input.document_id, result.page_count).await?;
            store.set_document_type(&input.document_id, result.document_type).await?;
            let mut stats = HashMap::new();
            stats.insert("elements".to_string(), result.elements.len() as i64);
            store
                .update_document_step_result(
                    &input.document_id,
                    "partition",
                    &started.complete(serde_json::json!({"element_count": result.elements.len()}), stats),
                )
                .await?;
            result
        }
        Err(e) => {
            store
                .update_document_step_result(&input.document_id, "partition", &started.fail(e.to_string()))
                .await?;
            return Err(e);
        }
    };

    // --- metadata ---
    let started = StepResult::started("metadata");
    let metadata_output = metadata_step::run_metadata_step(&partitioned.elements);
    let mut stats = HashMap::new();
    stats.insert("sections".to_string(), metadata_output.outline.len() as i64);
    stats.insert("warnings".to_string(), metadata_output.warning_count);
    store
        .update_document_step_result(
            &input.document_id,
            "metadata",
            &started.complete(serde_json::json!({"sections": metadata_output.outline.len()}), stats),
        )
        .await?;

    // --- enrichment ---
    let started = StepResult::started("enrichment");
    let mut elements = partitioned.elements;
    let object_store_ref = object_store;
    let enrichment_result = with_timeout(
        "enrichment",
        config.step_timeout,
        enrichment::run_enrichment_step(
            &mut elements,
            llm,
            run_id,
            &config.document_language_hint,
            |path: &str| async move { object_store_ref.get_elevated(path).await },
        ),
    )
    .await;
    match enrichment_result {
        Ok(summary) => {
            let mut stats = HashMap::new();
            stats.insert("captioned".to_string(), summary.captioned);
            stats.insert("failed".to_string(), summary.failed);
            store
                .update_document_step_result(
                    &input.document_id,
                    "enrichment",
                    &started.complete(serde_json::json!({"total": summary.total}), stats),
                )
                .await?;
        }
        Err(e) => {
            store
                .update_document_step_result(&input.document_id, "enrichment", &started.fail(e.to_string()))
                .await?;
            return Err(e);
        }
    }

    // --- chunking ---
    let started = StepResult::started("chunking");
    let chunks = chunking::run_chunking_step(&elements, &metadata_output, &input.document_id, run_id, &input.filename);
    let chunk_count = chunks.len() as i64;
    store.replace_chunks(&input.document_id, &chunks).await?;
    let mut stats = HashMap::new();
    stats.insert("chunks_created".to_string(), chunk_count);
    store
        .update_document_step_result(
            &input.document_id,
            "chunking",
            &started.complete(serde_json::json!({"chunk_count": chunk_count}), stats),
        )
        .await?;

    Ok(chunk_count)
}

/// Runs the full batch: per-document pipelines concurrently, then one
/// run-wide embedding pass, then aggregates run status.
pub async fn run_indexing(
    store: &SqliteStore,
    llm: &LlmClient,
    ocr: Option<&dyn OcrProvider>,
    object_store: &ObjectStore,
    config: &OrchestratorConfig,
    run_id: &str,
    upload_type: UploadType,
    documents: &[DocumentInput],
) -> Result<IndexingOutcome, CoreError> {
    store.update_run_status(run_id, RunStatus::Running, None).await?;

    let outcomes: Vec<(String, Result<i64, CoreError>)> = stream::iter(documents.iter())
        .map(|input| async move {
            let result = run_document_pipeline(store, llm, ocr, object_store, config, run_id, input).await;
            (input.document_id.clone(), result)
        })
        .buffer_unordered(config.max_concurrent_documents)
        .collect()
        .await;

    let mut failed_documents: Vec<String> = Vec::new();
    for (document_id, result) in &outcomes {
        if result.is_err() {
            failed_documents.push(document_id.clone());
        }
    }

    // Embedding step runs once for the run regardless of per-document
    // partial failures — chunks from documents that reached `chunking`
    // successfully are still embedded.
    let embedding_result = embedding_step::run_embedding_step(store, llm, run_id, run_id, &config.embedding_model).await;

    for (document_id, result) in &outcomes {
        if result.is_err() {
            continue;
        }
        let started = StepResult::started("embedding");
        let step_result = match &embedding_result {
            Ok(summary) => started.complete(
                serde_json::json!({}),
                HashMap::from([("tokens_embedded".to_string(), summary.embedded)]),
            ),
            Err(e) => started.fail(e.to_string()),
        };
        store.update_document_step_result(document_id, "embedding", &step_result).await?;
        if embedding_result.is_err() {
            failed_documents.push(document_id.clone());
        }
    }

    let all_succeeded = documents
        .iter()
        .all(|d| !failed_documents.contains(&d.document_id));

    let status = if all_succeeded && !documents.is_empty() {
        RunStatus::Completed
    } else {
        RunStatus::Failed
    };

    let error_message = if status == RunStatus::Failed {
        Some(format!("{} of {} documents failed indexing", failed_documents.len(), documents.len()))
    } else {
        None
    };
    store.update_run_status(run_id, status, error_message.as_deref()).await?;

    for document_id in &failed_documents {
        store.update_document_status(document_id, RunStatus::Failed).await?;
    }
    for document in documents {
        if !failed_documents.contains(&document.document_id) {
            store.update_document_status(&document.document_id, RunStatus::Completed).await?;
        }
    }

    Ok(IndexingOutcome {
        run_id: run_id.to_string(),
        status,
        should_trigger_wiki: status == RunStatus::Completed,
        upload_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_locked_invariants() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_documents, DEFAULT_MAX_CONCURRENT_DOCUMENTS);
        assert_eq!(config.embedding_model, "voyage-multilingual-2");
    }
}
