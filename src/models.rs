//! Core data models shared across the indexing and retrieval pipelines.
//!
//! These types mirror the entities in the data model: projects, indexing
//! runs, documents, chunks, wiki runs/pages, query runs, and checklist
//! runs/results. Storage adapters convert between these and their SQLite
//! row representations; pipeline steps pass them directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Read-scoping attribute carried by every user-visible entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Public,
    Auth,
    Owner,
    Private,
}

impl AccessLevel {
    /// Whether a caller with the given identity may read an entity at this level.
    pub fn readable_by(self, owner_id: Option<&str>, ctx: &crate::context::RequestContext) -> bool {
        match self {
            AccessLevel::Public => true,
            AccessLevel::Auth => ctx.is_authenticated,
            AccessLevel::Owner | AccessLevel::Private => {
                ctx.is_authenticated && ctx.owner_id.as_deref() == owner_id
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadType {
    Email,
    UserProject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The five ordered steps of the per-document indexing pipeline.
pub const STEP_ORDER: [&str; 5] = [
    "partition",
    "metadata",
    "enrichment",
    "chunking",
    "embedding",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The journaled outcome of a single pipeline step for a run or document.
///
/// `data` is the step-typed output payload serialized as JSON; typed
/// adapters at each step boundary convert to/from the structured form, so
/// no reflective deserialization is needed downstream of the step that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub status: StepStatus,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary_stats: HashMap<String, i64>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl StepResult {
    pub fn started(step: &str) -> Self {
        Self {
            step: step.to_string(),
            status: StepStatus::Running,
            duration_seconds: None,
            started_at: Utc::now(),
            completed_at: None,
            summary_stats: HashMap::new(),
            data: serde_json::Value::Null,
            error_message: None,
        }
    }

    pub fn complete(mut self, data: serde_json::Value, stats: HashMap<String, i64>) -> Self {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_seconds = Some((now - self.started_at).num_milliseconds() as f64 / 1000.0);
        self.status = StepStatus::Completed;
        self.data = data;
        self.summary_stats = stats;
        self
    }

    pub fn fail(mut self, error_message: impl Into<String>) -> Self {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_seconds = Some((now - self.started_at).num_milliseconds() as f64 / 1000.0);
        self.status = StepStatus::Failed;
        self.error_message = Some(error_message.into());
        self
    }
}

/// Mapping from step name to its journaled result, plus the derived
/// current-step computation used by both run- and document-level tracking.
pub type StepResults = HashMap<String, StepResult>;

/// The first step in [`STEP_ORDER`] not yet `completed`, or `None` if all are.
pub fn current_step(step_results: &StepResults) -> Option<&'static str> {
    STEP_ORDER.into_iter().find(|step| {
        !matches!(
            step_results.get(*step).map(|r| r.status),
            Some(StepStatus::Completed)
        )
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub access_level: AccessLevel,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingRun {
    pub id: String,
    pub upload_type: UploadType,
    pub owner_id: Option<String>,
    pub project_id: Option<String>,
    pub status: RunStatus,
    pub access_level: AccessLevel,
    #[serde(default)]
    pub step_results: StepResults,
    pub pipeline_config: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl IndexingRun {
    pub fn new(
        id: String,
        upload_type: UploadType,
        owner_id: Option<String>,
        project_id: Option<String>,
        access_level: AccessLevel,
    ) -> Self {
        Self {
            id,
            upload_type,
            owner_id,
            project_id,
            status: RunStatus::Pending,
            access_level,
            step_results: HashMap::new(),
            pipeline_config: None,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Native,
    Scanned,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub run_id: String,
    pub owner_id: Option<String>,
    pub access_level: AccessLevel,
    pub filename: String,
    pub size_bytes: i64,
    pub storage_path: String,
    pub page_count: Option<i64>,
    pub document_type: Option<DocumentType>,
    pub status: RunStatus,
    #[serde(default)]
    pub step_results: StepResults,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Bbox precision carried alongside a chunk's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BboxConfidence {
    Precise,
    Estimated,
    Merged,
}

/// Axis-aligned bounding box `[x0, y0, x1, y1]` in PDF points.
pub type Bbox = [f64; 4];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub page_number: i64,
    pub section_title: Option<String>,
    pub bbox: Option<Bbox>,
    pub bbox_confidence: Option<BboxConfidence>,
    /// Populated instead of `bbox` when a merged group spans pages.
    #[serde(default)]
    pub bbox_multi_page: Option<Vec<(i64, Bbox)>>,
    pub element_category: String,
    pub source_filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub run_id: String,
    pub chunk_index: i64,
    pub content: String,
    /// Exactly 1024-dimensional once embedded; `None` before the embedding step runs.
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
    pub created_at: DateTime<Utc>,
}

pub const EMBEDDING_DIMS: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiPlannedPage {
    pub id: String,
    pub title: String,
    pub description: String,
    pub queries: Vec<String>,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiRun {
    pub id: String,
    pub indexing_run_id: String,
    pub status: RunStatus,
    pub access_level: AccessLevel,
    #[serde(default)]
    pub step_results: StepResults,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub wiki_structure: Vec<WikiPlannedPage>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiPageMetadata {
    pub id: String,
    pub wiki_run_id: String,
    pub title: String,
    pub filename: String,
    pub order: i64,
    pub word_count: i64,
    pub storage_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultRef {
    pub chunk_id: String,
    pub content: String,
    pub similarity_score: f64,
    pub source_filename: String,
    pub page_number: Option<i64>,
    pub bbox: Option<Bbox>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRun {
    pub id: String,
    pub owner_id: Option<String>,
    pub indexing_run_id: String,
    pub query_text: String,
    pub variations: Vec<String>,
    pub search_results: Vec<SearchResultRef>,
    pub final_response: String,
    pub step_timings: HashMap<String, f64>,
    pub performance_metrics: serde_json::Value,
    pub access_level: AccessLevel,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Found,
    Missing,
    Risk,
    Conditions,
    PendingClarification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistSource {
    pub document: String,
    pub page: Option<i64>,
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistResult {
    pub id: String,
    pub analysis_run_id: String,
    pub item_number: i64,
    pub item_name: String,
    pub status: ChecklistStatus,
    pub description: String,
    pub confidence_score: Option<f64>,
    pub source_document: Option<String>,
    pub source_page: Option<i64>,
    pub source_excerpt: Option<String>,
    #[serde(default)]
    pub all_sources: Vec<ChecklistSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistAnalysisRun {
    pub id: String,
    pub indexing_run_id: String,
    pub owner_id: Option<String>,
    pub checklist_content: String,
    pub model_name: String,
    pub status: ChecklistRunStatus,
    pub raw_output: Option<String>,
    #[serde(default)]
    pub results: Vec<ChecklistResult>,
    pub progress_current: i64,
    pub progress_total: i64,
    pub error_message: Option<String>,
}

/// An upload destined for the Indexing Orchestrator (C5), generalizing the
/// teacher's `Connector::scan() -> Vec<SourceItem>` boundary to a single
/// batch handed in by either upload path (§6.1).
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub document_id: String,
    pub storage_path: String,
    pub filename: String,
    pub owner_id: Option<String>,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub run_id: String,
    pub upload_type: UploadType,
    pub owner_id: Option<String>,
    pub project_id: Option<String>,
    pub access_level: AccessLevel,
    pub documents: Vec<DocumentInput>,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Polymorphic element produced by partitioning (C6). Downstream steps
/// dispatch on `kind`; no inheritance hierarchy is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Element {
    Text(TextElement),
    Table(TableElement),
    Image(ImageElement),
    FullPage(FullPageElement),
}

impl Element {
    pub fn page_number(&self) -> i64 {
        match self {
            Element::Text(e) => e.page_number,
            Element::Table(e) => e.page_number,
            Element::Image(e) => e.page_number,
            Element::FullPage(e) => e.page_number,
        }
    }

    pub fn bbox(&self) -> Option<Bbox> {
        match self {
            Element::Text(e) => e.bbox,
            Element::Table(e) => e.bbox,
            Element::Image(e) => e.bbox,
            Element::FullPage(e) => e.bbox,
        }
    }

    pub fn reading_order_key(&self) -> (i64, i64, i64) {
        let bbox = self.bbox().unwrap_or([0.0, 0.0, 0.0, 0.0]);
        // Scaled to integer millipoints so the key is totally ordered (f64 isn't Ord).
        (self.page_number(), (bbox[1] * 1000.0) as i64, (bbox[0] * 1000.0) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextRole {
    Title,
    ListItem,
    NarrativeText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextElement {
    pub page_number: i64,
    pub text: String,
    pub role: TextRole,
    pub bbox: Option<Bbox>,
    pub font_size: Option<f64>,
    #[serde(default)]
    pub section_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableElement {
    pub page_number: i64,
    pub rows: Vec<Vec<String>>,
    pub bbox: Option<Bbox>,
    pub confidence: f64,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageElement {
    pub page_number: i64,
    pub storage_ref: Option<String>,
    pub bbox: Option<Bbox>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullPageElement {
    pub page_number: i64,
    pub storage_ref: String,
    pub dpi: u32,
    pub bbox: Option<Bbox>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_step_empty_is_partition() {
        let results = StepResults::new();
        assert_eq!(current_step(&results), Some("partition"));
    }

    #[test]
    fn current_step_advances_past_completed() {
        let mut results = StepResults::new();
        results.insert(
            "partition".to_string(),
            StepResult::started("partition").complete(serde_json::Value::Null, HashMap::new()),
        );
        assert_eq!(current_step(&results), Some("metadata"));
    }

    #[test]
    fn current_step_none_when_all_done() {
        let mut results = StepResults::new();
        for step in STEP_ORDER {
            results.insert(
                step.to_string(),
                StepResult::started(step).complete(serde_json::Value::Null, HashMap::new()),
            );
        }
        assert_eq!(current_step(&results), None);
    }

    #[test]
    fn failed_step_is_not_current() {
        let mut results = StepResults::new();
        results.insert(
            "partition".to_string(),
            StepResult::started("partition").fail("boom"),
        );
        assert_eq!(current_step(&results), Some("partition"));
    }
}
