//! HTTP API (§6): the inbound surface over indexing, query, wiki artifacts,
//! and checklist analysis. Axum router with CORS and request tracing.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{CoreError, ErrorEnvelope};
use crate::llm_client::LlmClient;
use crate::models::{new_id, AccessLevel, DocumentInput, UploadType};
use crate::object_store::{storage_path, ObjectStore, StoragePathKind};
use crate::orchestrator::{self, OrchestratorConfig};
use crate::store::SqliteStore;
use crate::{checklist, generation, wiki};

pub struct AppState {
    pub store: SqliteStore,
    pub llm: LlmClient,
    pub object_store: ObjectStore,
    pub config: Config,
}

pub type SharedState = Arc<AppState>;

struct AppError(CoreError);

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope::from_error(&self.0, &new_id());
        let status = ErrorEnvelope::http_status(self.0.category());
        (status, Json(envelope)).into_response()
    }
}

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::run_migrations(config).await?;

    let llm = LlmClient::new(
        config.llm.clone(),
        std::env::var("LLM_API_KEY")?,
        config.defaults.max_retries,
        config.defaults.timeout_secs,
    )?;
    let object_store = ObjectStore::new(&config.object_store.root);
    let state = Arc::new(AppState {
        store: SqliteStore::new(pool),
        llm,
        object_store,
        config: config.clone(),
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "starting HTTP server");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/indexing", post(trigger_indexing))
        .route("/indexing/{run_id}", get(get_indexing_run))
        .route("/queries", post(submit_query))
        .route("/wikis/{wiki_run_id}/pages", get(list_wiki_pages))
        .route("/wikis/{wiki_run_id}/pages/{name}", get(get_wiki_page))
        .route("/wikis/{wiki_run_id}/metadata", get(get_wiki_metadata))
        .route("/checklists/analyze", post(analyze_checklist))
        .route("/checklists/runs/{id}", get(get_checklist_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct IndexingTriggerBody {
    files: Vec<IndexingFile>,
    upload_type: UploadType,
    email: Option<String>,
    project_id: Option<String>,
    owner_id: Option<String>,
}

#[derive(Deserialize)]
struct IndexingFile {
    filename: String,
    storage_path: String,
}

#[derive(Serialize)]
struct IndexingTriggerResponse {
    run_id: String,
    tracking_url: String,
}

/// `POST /indexing` (§6.1): accepts a batch of already-uploaded PDFs and
/// kicks off the Indexing Orchestrator (C5) as a background task.
async fn trigger_indexing(
    State(state): State<SharedState>,
    Json(body): Json<IndexingTriggerBody>,
) -> Result<impl IntoResponse, AppError> {
    if body.files.is_empty() {
        return Err(AppError(CoreError::Validation("files[] must not be empty".to_string())));
    }
    let access_level = match body.upload_type {
        UploadType::Email => AccessLevel::Public,
        UploadType::UserProject => AccessLevel::Private,
    };

    let run = crate::models::IndexingRun::new(
        new_id(),
        body.upload_type,
        body.owner_id.clone(),
        body.project_id.clone(),
        access_level,
    );
    state.store.create_run(&run).await.map_err(AppError)?;

    let mut documents = Vec::with_capacity(body.files.len());
    for file in &body.files {
        let document_id = new_id();
        let storage_path = match body.upload_type {
            UploadType::Email => storage_path(StoragePathKind::EmailPdf {
                run_id: &run.id,
                doc_id: &document_id,
            }),
            UploadType::UserProject => storage_path(StoragePathKind::ProjectPdf {
                owner_id: body.owner_id.as_deref().unwrap_or("unknown"),
                project_id: body.project_id.as_deref().unwrap_or("unknown"),
                run_id: &run.id,
                doc_id: &document_id,
            }),
        };
        let bytes = state
            .object_store
            .get_elevated(&file.storage_path)
            .await
            .map_err(AppError)?;
        state
            .object_store
            .put_elevated(&storage_path, &bytes)
            .await
            .map_err(AppError)?;

        let document = crate::models::Document {
            id: document_id.clone(),
            run_id: run.id.clone(),
            owner_id: body.owner_id.clone(),
            access_level,
            filename: file.filename.clone(),
            size_bytes: bytes.len() as i64,
            storage_path: storage_path.clone(),
            page_count: None,
            document_type: None,
            status: crate::models::RunStatus::Pending,
            step_results: Default::default(),
            metadata: serde_json::json!({}),
        };
        state.store.create_document(&document).await.map_err(AppError)?;
        documents.push(DocumentInput {
            document_id,
            storage_path,
            filename: file.filename.clone(),
            owner_id: body.owner_id.clone(),
            access_level,
        });
    }

    let run_id = run.id.clone();
    let upload_type = body.upload_type;
    let email = body.email.clone();
    let project_name = body.project_id.clone().unwrap_or_else(|| "Untitled Project".to_string());
    tokio::spawn(async move {
        let config = OrchestratorConfig {
            embedding_model: state.config.defaults.embedding_model.clone(),
            ..OrchestratorConfig::default()
        };
        let outcome = orchestrator::run_indexing(
            &state.store,
            &state.llm,
            None,
            &state.object_store,
            &config,
            &run_id,
            upload_type,
            &documents,
        )
        .await;

        match outcome {
            Ok(outcome) if outcome.should_trigger_wiki => {
                let ctx = RequestContext::anonymous();
                if let Err(e) = wiki::generate_wiki(
                    &state.store,
                    &state.llm,
                    &state.object_store,
                    &wiki::NoopNotifier,
                    &run_id,
                    &state.config.defaults.embedding_model,
                    &run_id,
                    &project_name,
                    email.as_deref(),
                    state.config.wiki.get("regenerate_on_rerun").and_then(|v| v.as_bool()).unwrap_or(false),
                    &ctx,
                )
                .await
                {
                    tracing::error!(run_id = %run_id, error = %e, "wiki generation failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "indexing run failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(IndexingTriggerResponse {
            tracking_url: format!("/indexing/{}", run.id),
            run_id: run.id,
        }),
    ))
}

async fn get_indexing_run(
    State(state): State<SharedState>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = state
        .store
        .get_run(&run_id)
        .await
        .map_err(AppError)?
        .ok_or_else(|| AppError(CoreError::not_found("indexing_run", &run_id)))?;
    Ok(Json(run))
}

#[derive(Deserialize)]
struct QueryBody {
    query: String,
    indexing_run_id: String,
    top_k: Option<i64>,
}

/// `POST /queries` (§6.2): runs retrieval + generation (C11/C12) end to end.
async fn submit_query(
    State(state): State<SharedState>,
    Json(body): Json<QueryBody>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = RequestContext::anonymous();
    let request_id = new_id();
    let result = generation::answer_query(
        &state.store,
        &state.llm,
        &request_id,
        &state.config.defaults.embedding_model,
        &body.query,
        &body.indexing_run_id,
        body.top_k,
        &ctx,
    )
    .await
    .map_err(AppError)?;

    Ok(Json(serde_json::json!({
        "id": request_id,
        "query": body.query,
        "response": result.answer,
        "search_results": result.citations,
        "performance_metrics": result.performance_metrics,
        "step_timings": result.step_timings,
    })))
}

#[derive(Serialize)]
struct WikiPageSummary {
    filename: String,
    title: String,
    order: i64,
    size: i64,
    storage_url: String,
}

/// `GET /wikis/{wiki_run_id}/pages` (§6.3).
async fn list_wiki_pages(
    State(state): State<SharedState>,
    AxumPath(wiki_run_id): AxumPath<String>,
) -> Result<impl IntoResponse, AppError> {
    let pages = state.store.list_wiki_pages(&wiki_run_id).await.map_err(AppError)?;
    let summaries: Vec<WikiPageSummary> = pages
        .into_iter()
        .map(|p| WikiPageSummary {
            storage_url: state.object_store.signed_url(&p.storage_path, 3600),
            filename: p.filename,
            title: p.title,
            order: p.order,
            size: p.word_count,
        })
        .collect();
    Ok(Json(serde_json::json!({ "pages": summaries })))
}

/// `GET /wikis/{wiki_run_id}/pages/{name}` (§6.3).
async fn get_wiki_page(
    State(state): State<SharedState>,
    AxumPath((wiki_run_id, name)): AxumPath<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let pages = state.store.list_wiki_pages(&wiki_run_id).await.map_err(AppError)?;
    let page = pages
        .into_iter()
        .find(|p| p.filename.trim_end_matches(".md") == name)
        .ok_or_else(|| AppError(CoreError::not_found("wiki_page", &name)))?;
    let content_bytes = state
        .object_store
        .get_elevated(&page.storage_path)
        .await
        .map_err(AppError)?;
    let content = String::from_utf8_lossy(&content_bytes).into_owned();

    Ok(Json(serde_json::json!({
        "name": name,
        "title": page.title,
        "content": content,
        "metadata": { "order": page.order, "word_count": page.word_count },
    })))
}

/// `GET /wikis/{wiki_run_id}/metadata` (§6.3).
async fn get_wiki_metadata(
    State(state): State<SharedState>,
    AxumPath(wiki_run_id): AxumPath<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = state
        .store
        .get_wiki_run(&wiki_run_id)
        .await
        .map_err(AppError)?
        .ok_or_else(|| AppError(CoreError::not_found("wiki_run", &wiki_run_id)))?;
    Ok(Json(run))
}

#[derive(Deserialize)]
struct ChecklistAnalyzeBody {
    indexing_run_id: String,
    checklist_content: String,
    #[allow(dead_code)]
    checklist_name: String,
    model_name: Option<String>,
    owner_id: Option<String>,
}

/// `POST /checklists/analyze` (§6.4).
async fn analyze_checklist(
    State(state): State<SharedState>,
    Json(body): Json<ChecklistAnalyzeBody>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = RequestContext::anonymous();
    let request_id = new_id();
    let model_name = body.model_name.unwrap_or_else(|| state.config.llm.chat_model.clone());
    let run = checklist::analyze_checklist(
        &state.store,
        &state.llm,
        &request_id,
        &state.config.defaults.embedding_model,
        &body.indexing_run_id,
        body.owner_id.as_deref(),
        &body.checklist_content,
        &model_name,
        &ctx,
    )
    .await
    .map_err(AppError)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "analysis_run_id": run.id, "status": run.status })),
    ))
}

async fn get_checklist_run(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<impl IntoResponse, AppError> {
    let run = state
        .store
        .get_checklist_run(&id)
        .await
        .map_err(AppError)?
        .ok_or_else(|| AppError(CoreError::not_found("checklist_run", &id)))?;
    Ok(Json(run))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_maps_not_found_to_404() {
        let err = CoreError::not_found("document", "d1");
        let status = ErrorEnvelope::http_status(err.category());
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_envelope_maps_validation_to_400() {
        let err = CoreError::Validation("files[] must not be empty".to_string());
        let status = ErrorEnvelope::http_status(err.category());
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
