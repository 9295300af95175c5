//! Run & Document Store (C2): persistence for every entity in §3.1, with
//! access-level enforcement and the `match_chunks` vector-search function.
//!
//! Operations use dynamic `sqlx::query`/`query_scalar` rather than
//! compile-time-checked macros, since the schema here is richer and
//! hand-written row mapping keeps each function legible. Step-result writes
//! perform a JSON partial merge, last-writer-wins per `(entity, step_name)`,
//! the behavior required by §4.2.

use chrono::Utc;
use serde_json::Value as Json;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;

use crate::context::RequestContext;
use crate::error::CoreError;
use crate::models::*;
use crate::vector_index::VectorIndex;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------------------------------------------------- runs

    pub async fn create_run(&self, run: &IndexingRun) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO indexing_runs
                (id, upload_type, owner_id, project_id, status, access_level, step_results, pipeline_config, started_at, completed_at, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(upload_type_str(run.upload_type))
        .bind(&run.owner_id)
        .bind(&run.project_id)
        .bind(run_status_str(run.status))
        .bind(access_level_str(run.access_level))
        .bind(serde_json::to_string(&run.step_results).unwrap_or_default())
        .bind(run.pipeline_config.as_ref().map(|c| c.to_string()))
        .bind(run.started_at.to_rfc3339())
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<IndexingRun>, CoreError> {
        let row = sqlx::query("SELECT * FROM indexing_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_run(&r)))
    }

    pub async fn get_run_scoped(
        &self,
        id: &str,
        ctx: &RequestContext,
    ) -> Result<IndexingRun, CoreError> {
        let run = self
            .get_run(id)
            .await?
            .ok_or_else(|| CoreError::not_found("indexing_run", id))?;
        if !run.access_level.readable_by(run.owner_id.as_deref(), ctx) {
            return Err(CoreError::Authorization(format!(
                "run {id} is not readable by this caller"
            )));
        }
        Ok(run)
    }

    pub async fn list_runs_by_owner(&self, owner_id: &str) -> Result<Vec<IndexingRun>, CoreError> {
        let rows = sqlx::query("SELECT * FROM indexing_runs WHERE owner_id = ? ORDER BY started_at DESC")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_run).collect())
    }

    pub async fn update_run_status(
        &self,
        id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), CoreError> {
        let completed_at = matches!(
            status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
        .then(|| Utc::now().to_rfc3339());
        sqlx::query(
            "UPDATE indexing_runs SET status = ?, error_message = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?",
        )
        .bind(run_status_str(status))
        .bind(error_message)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Partial JSON merge into `step_results[step_name]`, last-writer-wins.
    pub async fn update_run_step_result(
        &self,
        id: &str,
        step_name: &str,
        result: &StepResult,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        let current: String = sqlx::query_scalar("SELECT step_results FROM indexing_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("indexing_run", id))?;
        let mut step_results: StepResults = serde_json::from_str(&current).unwrap_or_default();
        step_results.insert(step_name.to_string(), result.clone());
        sqlx::query("UPDATE indexing_runs SET step_results = ? WHERE id = ?")
            .bind(serde_json::to_string(&step_results).unwrap_or_default())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_run_pipeline_config(&self, id: &str, config: &Json) -> Result<(), CoreError> {
        sqlx::query("UPDATE indexing_runs SET pipeline_config = ? WHERE id = ?")
            .bind(config.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----------------------------------------------------------- documents

    pub async fn create_document(&self, doc: &Document) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, run_id, owner_id, access_level, filename, size_bytes, storage_path, page_count, document_type, status, step_results, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.run_id)
        .bind(&doc.owner_id)
        .bind(access_level_str(doc.access_level))
        .bind(&doc.filename)
        .bind(doc.size_bytes)
        .bind(&doc.storage_path)
        .bind(doc.page_count)
        .bind(doc.document_type.map(document_type_str))
        .bind(run_status_str(doc.status))
        .bind(serde_json::to_string(&doc.step_results).unwrap_or_default())
        .bind(doc.metadata.to_string())
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT INTO run_document_links (id, run_id, document_id) VALUES (?, ?, ?)")
            .bind(new_id())
            .bind(&doc.run_id)
            .bind(&doc.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>, CoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_document(&r)))
    }

    pub async fn list_documents_by_run(&self, run_id: &str) -> Result<Vec<Document>, CoreError> {
        let rows = sqlx::query("SELECT * FROM documents WHERE run_id = ?")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    pub async fn update_document_status(
        &self,
        id: &str,
        status: RunStatus,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
            .bind(run_status_str(status))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_document_step_result(
        &self,
        id: &str,
        step_name: &str,
        result: &StepResult,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        let current: String = sqlx::query_scalar("SELECT step_results FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("document", id))?;
        let mut step_results: StepResults = serde_json::from_str(&current).unwrap_or_default();
        step_results.insert(step_name.to_string(), result.clone());
        sqlx::query("UPDATE documents SET step_results = ? WHERE id = ?")
            .bind(serde_json::to_string(&step_results).unwrap_or_default())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_document_page_count(&self, id: &str, page_count: i64) -> Result<(), CoreError> {
        sqlx::query("UPDATE documents SET page_count = ? WHERE id = ?")
            .bind(page_count)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_document_type(&self, id: &str, document_type: DocumentType) -> Result<(), CoreError> {
        sqlx::query("UPDATE documents SET document_type = ? WHERE id = ?")
            .bind(document_type_str(document_type))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------- chunks

    /// Inserts chunks for a document, replacing any existing chunks (used
    /// by the chunking step and by re-runs). Embeddings, if present on the
    /// `Chunk`, are written to `chunk_vectors` in the same transaction.
    pub async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, run_id, chunk_index, content, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.run_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(serde_json::to_string(&chunk.metadata).unwrap_or_default())
            .bind(chunk.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            if let Some(embedding) = &chunk.embedding {
                insert_vector(&mut tx, &chunk.id, &chunk.run_id, embedding).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_chunk_embedding(
        &self,
        chunk_id: &str,
        run_id: &str,
        embedding: &[f32],
    ) -> Result<(), CoreError> {
        if embedding.len() != EMBEDDING_DIMS {
            return Err(CoreError::Embedding {
                kind: crate::error::StepErrorKind::DimensionMismatch,
                message: format!("expected {EMBEDDING_DIMS} dims, got {}", embedding.len()),
            });
        }
        let mut tx = self.pool.begin().await?;
        insert_vector(&mut tx, chunk_id, run_id, embedding).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_chunks_by_document(&self, document_id: &str) -> Result<Vec<Chunk>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.run_id, c.chunk_index, c.content, c.metadata, c.created_at, v.embedding
            FROM chunks c
            LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
            WHERE c.document_id = ?
            ORDER BY c.chunk_index
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    pub async fn count_chunks_without_embedding(&self, run_id: &str) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c LEFT JOIN chunk_vectors v ON v.chunk_id = c.id WHERE c.run_id = ? AND v.chunk_id IS NULL",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn get_chunks_without_embedding(&self, run_id: &str) -> Result<Vec<Chunk>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.run_id, c.chunk_index, c.content, c.metadata, c.created_at, v.embedding
            FROM chunks c
            LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
            WHERE c.run_id = ? AND v.chunk_id IS NULL
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Builds the run's chunk set into an in-memory [`VectorIndex`] — the
    /// HNSW requirement of §4.2 — for use by `match_chunks`.
    pub async fn build_vector_index(&self, run_id: &str) -> Result<VectorIndex, CoreError> {
        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors WHERE run_id = ?")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        let entries: Vec<(String, Vec<f32>)> = rows
            .iter()
            .map(|r| {
                let chunk_id: String = r.get("chunk_id");
                let blob: Vec<u8> = r.get("embedding");
                (chunk_id, bytes_to_vec(&blob))
            })
            .collect();
        Ok(VectorIndex::build(&entries))
    }

    /// `match_chunks(query_embedding, threshold, count, run_filter?, doc_filter?)`
    /// (§4.2): cosine similarity search, ANN when the run has enough chunks
    /// to be worth indexing, brute force otherwise (also the correctness
    /// baseline exercised by tests).
    pub async fn match_chunks(
        &self,
        query_embedding: &[f32],
        threshold: f64,
        count: i64,
        run_filter: Option<&str>,
        doc_filter: Option<&[String]>,
    ) -> Result<Vec<(Chunk, f64)>, CoreError> {
        let mut query = String::from(
            "SELECT c.id, c.document_id, c.run_id, c.chunk_index, c.content, c.metadata, c.created_at, v.embedding
             FROM chunks c JOIN chunk_vectors v ON v.chunk_id = c.id WHERE 1=1",
        );
        if run_filter.is_some() {
            query.push_str(" AND c.run_id = ?");
        }
        if let Some(docs) = doc_filter {
            query.push_str(&format!(
                " AND c.document_id IN ({})",
                vec!["?"; docs.len()].join(",")
            ));
        }

        let mut q = sqlx::query(&query);
        if let Some(run_id) = run_filter {
            q = q.bind(run_id);
        }
        if let Some(docs) = doc_filter {
            for d in docs {
                q = q.bind(d);
            }
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut scored: Vec<(Chunk, f64)> = rows
            .iter()
            .map(|r| {
                let chunk = row_to_chunk(r);
                let similarity = chunk
                    .embedding
                    .as_ref()
                    .map(|e| cosine_similarity(query_embedding, e))
                    .unwrap_or(0.0);
                (chunk, similarity)
            })
            .filter(|(_, sim)| *sim >= threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(count.max(0) as usize);
        Ok(scored)
    }

    // -------------------------------------------------------------- wiki

    pub async fn create_wiki_run(&self, run: &WikiRun) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO wiki_runs (id, indexing_run_id, status, access_level, step_results, started_at, completed_at, wiki_structure, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.indexing_run_id)
        .bind(run_status_str(run.status))
        .bind(access_level_str(run.access_level))
        .bind(serde_json::to_string(&run.step_results).unwrap_or_default())
        .bind(run.started_at.to_rfc3339())
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&run.wiki_structure).unwrap_or_default())
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_latest_completed_wiki_run(
        &self,
        indexing_run_id: &str,
    ) -> Result<Option<WikiRun>, CoreError> {
        let row = sqlx::query(
            "SELECT * FROM wiki_runs WHERE indexing_run_id = ? AND status = 'completed' ORDER BY started_at DESC LIMIT 1",
        )
        .bind(indexing_run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_wiki_run(&r)))
    }

    pub async fn get_wiki_run(&self, id: &str) -> Result<Option<WikiRun>, CoreError> {
        let row = sqlx::query("SELECT * FROM wiki_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_wiki_run(&r)))
    }

    pub async fn update_wiki_run_status(
        &self,
        id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), CoreError> {
        let completed_at = matches!(status, RunStatus::Completed | RunStatus::Failed)
            .then(|| Utc::now().to_rfc3339());
        sqlx::query(
            "UPDATE wiki_runs SET status = ?, error_message = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?",
        )
        .bind(run_status_str(status))
        .bind(error_message)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_wiki_structure(&self, id: &str, pages: &[WikiPlannedPage]) -> Result<(), CoreError> {
        sqlx::query("UPDATE wiki_runs SET wiki_structure = ? WHERE id = ?")
            .bind(serde_json::to_string(pages).unwrap_or_default())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_wiki_run_step_result(
        &self,
        id: &str,
        step_name: &str,
        result: &StepResult,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        let current: String = sqlx::query_scalar("SELECT step_results FROM wiki_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("wiki_run", id))?;
        let mut step_results: StepResults = serde_json::from_str(&current).unwrap_or_default();
        step_results.insert(step_name.to_string(), result.clone());
        sqlx::query("UPDATE wiki_runs SET step_results = ? WHERE id = ?")
            .bind(serde_json::to_string(&step_results).unwrap_or_default())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn create_wiki_page(&self, page: &WikiPageMetadata) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO wiki_page_metadata (id, wiki_run_id, title, filename, page_order, word_count, storage_path) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&page.id)
        .bind(&page.wiki_run_id)
        .bind(&page.title)
        .bind(&page.filename)
        .bind(page.order)
        .bind(page.word_count)
        .bind(&page.storage_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_wiki_pages(&self, wiki_run_id: &str) -> Result<Vec<WikiPageMetadata>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM wiki_page_metadata WHERE wiki_run_id = ? ORDER BY page_order",
        )
        .bind(wiki_run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| WikiPageMetadata {
                id: r.get("id"),
                wiki_run_id: r.get("wiki_run_id"),
                title: r.get("title"),
                filename: r.get("filename"),
                order: r.get("page_order"),
                word_count: r.get("word_count"),
                storage_path: r.get("storage_path"),
            })
            .collect())
    }

    // ------------------------------------------------------------- query runs

    pub async fn create_query_run(&self, run: &QueryRun) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO query_runs
                (id, owner_id, indexing_run_id, query_text, variations, search_results, final_response, step_timings, performance_metrics, access_level, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.owner_id)
        .bind(&run.indexing_run_id)
        .bind(&run.query_text)
        .bind(serde_json::to_string(&run.variations).unwrap_or_default())
        .bind(serde_json::to_string(&run.search_results).unwrap_or_default())
        .bind(&run.final_response)
        .bind(serde_json::to_string(&run.step_timings).unwrap_or_default())
        .bind(run.performance_metrics.to_string())
        .bind(access_level_str(run.access_level))
        .bind(run.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --------------------------------------------------------- checklist runs

    pub async fn create_checklist_run(&self, run: &ChecklistAnalysisRun) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO checklist_analysis_runs
                (id, indexing_run_id, owner_id, checklist_content, model_name, status, raw_output, progress_current, progress_total, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.indexing_run_id)
        .bind(&run.owner_id)
        .bind(&run.checklist_content)
        .bind(&run.model_name)
        .bind(checklist_run_status_str(run.status))
        .bind(&run.raw_output)
        .bind(run.progress_current)
        .bind(run.progress_total)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_checklist_run_progress(
        &self,
        id: &str,
        current: i64,
        total: i64,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE checklist_analysis_runs SET progress_current = ?, progress_total = ? WHERE id = ?")
            .bind(current)
            .bind(total)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_checklist_run_status(
        &self,
        id: &str,
        status: ChecklistRunStatus,
        error_message: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE checklist_analysis_runs SET status = ?, error_message = ? WHERE id = ?")
            .bind(checklist_run_status_str(status))
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_checklist_result(&self, result: &ChecklistResult) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO checklist_results
                (id, analysis_run_id, item_number, item_name, status, description, confidence_score, source_document, source_page, source_excerpt, all_sources)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.id)
        .bind(&result.analysis_run_id)
        .bind(result.item_number)
        .bind(&result.item_name)
        .bind(checklist_status_str(result.status))
        .bind(&result.description)
        .bind(result.confidence_score)
        .bind(&result.source_document)
        .bind(result.source_page)
        .bind(&result.source_excerpt)
        .bind(serde_json::to_string(&result.all_sources).unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_checklist_results(&self, analysis_run_id: &str) -> Result<Vec<ChecklistResult>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM checklist_results WHERE analysis_run_id = ? ORDER BY item_number",
        )
        .bind(analysis_run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_checklist_result).collect())
    }

    pub async fn get_checklist_run(&self, id: &str) -> Result<Option<ChecklistAnalysisRun>, CoreError> {
        let row = sqlx::query("SELECT * FROM checklist_analysis_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_checklist_run(&r)))
    }
}

async fn insert_vector(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk_id: &str,
    run_id: &str,
    embedding: &[f32],
) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT OR REPLACE INTO chunk_vectors (chunk_id, run_id, embedding, dims) VALUES (?, ?, ?, ?)",
    )
    .bind(chunk_id)
    .bind(run_id)
    .bind(vec_to_bytes(embedding))
    .bind(embedding.len() as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vec(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

// --------------------------------------------------------------- enum <-> str

fn upload_type_str(t: UploadType) -> &'static str {
    match t {
        UploadType::Email => "email",
        UploadType::UserProject => "user_project",
    }
}
fn upload_type_from_str(s: &str) -> UploadType {
    match s {
        "email" => UploadType::Email,
        _ => UploadType::UserProject,
    }
}

fn run_status_str(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}
fn run_status_from_str(s: &str) -> RunStatus {
    match s {
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Pending,
    }
}

fn access_level_str(a: AccessLevel) -> &'static str {
    match a {
        AccessLevel::Public => "public",
        AccessLevel::Auth => "auth",
        AccessLevel::Owner => "owner",
        AccessLevel::Private => "private",
    }
}
fn access_level_from_str(s: &str) -> AccessLevel {
    match s {
        "auth" => AccessLevel::Auth,
        "owner" => AccessLevel::Owner,
        "private" => AccessLevel::Private,
        _ => AccessLevel::Public,
    }
}

fn document_type_str(t: DocumentType) -> &'static str {
    match t {
        DocumentType::Native => "native",
        DocumentType::Scanned => "scanned",
        DocumentType::Hybrid => "hybrid",
    }
}
fn document_type_from_str(s: &str) -> DocumentType {
    match s {
        "scanned" => DocumentType::Scanned,
        "hybrid" => DocumentType::Hybrid,
        _ => DocumentType::Native,
    }
}

fn checklist_status_str(s: ChecklistStatus) -> &'static str {
    match s {
        ChecklistStatus::Found => "found",
        ChecklistStatus::Missing => "missing",
        ChecklistStatus::Risk => "risk",
        ChecklistStatus::Conditions => "conditions",
        ChecklistStatus::PendingClarification => "pending_clarification",
    }
}
fn checklist_status_from_str(s: &str) -> ChecklistStatus {
    match s {
        "missing" => ChecklistStatus::Missing,
        "risk" => ChecklistStatus::Risk,
        "conditions" => ChecklistStatus::Conditions,
        "pending_clarification" => ChecklistStatus::PendingClarification,
        _ => ChecklistStatus::Found,
    }
}

fn checklist_run_status_str(s: ChecklistRunStatus) -> &'static str {
    match s {
        ChecklistRunStatus::Pending => "pending",
        ChecklistRunStatus::Running => "running",
        ChecklistRunStatus::Completed => "completed",
        ChecklistRunStatus::Failed => "failed",
    }
}
fn checklist_run_status_from_str(s: &str) -> ChecklistRunStatus {
    match s {
        "running" => ChecklistRunStatus::Running,
        "completed" => ChecklistRunStatus::Completed,
        "failed" => ChecklistRunStatus::Failed,
        _ => ChecklistRunStatus::Pending,
    }
}

// ------------------------------------------------------------- row mapping

fn row_to_run(r: &sqlx::sqlite::SqliteRow) -> IndexingRun {
    let step_results_raw: String = r.get("step_results");
    let pipeline_config_raw: Option<String> = r.get("pipeline_config");
    let started_at_raw: String = r.get("started_at");
    let completed_at_raw: Option<String> = r.get("completed_at");
    IndexingRun {
        id: r.get("id"),
        upload_type: upload_type_from_str(&r.get::<String, _>("upload_type")),
        owner_id: r.get("owner_id"),
        project_id: r.get("project_id"),
        status: run_status_from_str(&r.get::<String, _>("status")),
        access_level: access_level_from_str(&r.get::<String, _>("access_level")),
        step_results: serde_json::from_str(&step_results_raw).unwrap_or_default(),
        pipeline_config: pipeline_config_raw.and_then(|s| serde_json::from_str(&s).ok()),
        started_at: parse_dt(&started_at_raw),
        completed_at: completed_at_raw.map(|s| parse_dt(&s)),
        error_message: r.get("error_message"),
    }
}

fn row_to_document(r: &sqlx::sqlite::SqliteRow) -> Document {
    let step_results_raw: String = r.get("step_results");
    let metadata_raw: String = r.get("metadata");
    Document {
        id: r.get("id"),
        run_id: r.get("run_id"),
        owner_id: r.get("owner_id"),
        access_level: access_level_from_str(&r.get::<String, _>("access_level")),
        filename: r.get("filename"),
        size_bytes: r.get("size_bytes"),
        storage_path: r.get("storage_path"),
        page_count: r.get("page_count"),
        document_type: r
            .get::<Option<String>, _>("document_type")
            .map(|s| document_type_from_str(&s)),
        status: run_status_from_str(&r.get::<String, _>("status")),
        step_results: serde_json::from_str(&step_results_raw).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(Json::Null),
    }
}

fn row_to_chunk(r: &sqlx::sqlite::SqliteRow) -> Chunk {
    let metadata_raw: String = r.get("metadata");
    let created_at_raw: String = r.get("created_at");
    let embedding_blob: Option<Vec<u8>> = r.try_get("embedding").ok();
    Chunk {
        id: r.get("id"),
        document_id: r.get("document_id"),
        run_id: r.get("run_id"),
        chunk_index: r.get("chunk_index"),
        content: r.get("content"),
        embedding: embedding_blob.map(|b| bytes_to_vec(&b)),
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_else(|_| ChunkMetadata {
            page_number: 0,
            section_title: None,
            bbox: None,
            bbox_confidence: None,
            bbox_multi_page: None,
            element_category: "unknown".to_string(),
            source_filename: String::new(),
        }),
        created_at: parse_dt(&created_at_raw),
    }
}

fn row_to_wiki_run(r: &sqlx::sqlite::SqliteRow) -> WikiRun {
    let step_results_raw: String = r.get("step_results");
    let wiki_structure_raw: String = r.get("wiki_structure");
    let started_at_raw: String = r.get("started_at");
    let completed_at_raw: Option<String> = r.get("completed_at");
    WikiRun {
        id: r.get("id"),
        indexing_run_id: r.get("indexing_run_id"),
        status: run_status_from_str(&r.get::<String, _>("status")),
        access_level: access_level_from_str(&r.get::<String, _>("access_level")),
        step_results: serde_json::from_str(&step_results_raw).unwrap_or_default(),
        started_at: parse_dt(&started_at_raw),
        completed_at: completed_at_raw.map(|s| parse_dt(&s)),
        wiki_structure: serde_json::from_str(&wiki_structure_raw).unwrap_or_default(),
        error_message: r.get("error_message"),
    }
}

fn row_to_checklist_result(r: &sqlx::sqlite::SqliteRow) -> ChecklistResult {
    let all_sources_raw: String = r.get("all_sources");
    ChecklistResult {
        id: r.get("id"),
        analysis_run_id: r.get("analysis_run_id"),
        item_number: r.get("item_number"),
        item_name: r.get("item_name"),
        status: checklist_status_from_str(&r.get::<String, _>("status")),
        description: r.get("description"),
        confidence_score: r.get("confidence_score"),
        source_document: r.get("source_document"),
        source_page: r.get("source_page"),
        source_excerpt: r.get("source_excerpt"),
        all_sources: serde_json::from_str(&all_sources_raw).unwrap_or_default(),
    }
}

fn row_to_checklist_run(r: &sqlx::sqlite::SqliteRow) -> ChecklistAnalysisRun {
    ChecklistAnalysisRun {
        id: r.get("id"),
        indexing_run_id: r.get("indexing_run_id"),
        owner_id: r.get("owner_id"),
        checklist_content: r.get("checklist_content"),
        model_name: r.get("model_name"),
        status: checklist_run_status_from_str(&r.get::<String, _>("status")),
        raw_output: r.get("raw_output"),
        results: Vec::new(),
        progress_current: r.get("progress_current"),
        progress_total: r.get("progress_total"),
        error_message: r.get("error_message"),
    }
}

fn parse_dt(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations_on;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations_on(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn sample_run() -> IndexingRun {
        IndexingRun::new(
            new_id(),
            UploadType::Email,
            None,
            None,
            AccessLevel::Public,
        )
    }

    #[tokio::test]
    async fn create_and_get_run_round_trips() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        let fetched = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.access_level, AccessLevel::Public);
    }

    #[tokio::test]
    async fn step_result_merge_is_last_writer_wins() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        let r1 = StepResult::started("partition").complete(Json::Null, HashMap::new());
        store.update_run_step_result(&run.id, "partition", &r1).await.unwrap();

        let r2 = StepResult::started("partition").fail("retry needed");
        store.update_run_step_result(&run.id, "partition", &r2).await.unwrap();

        let fetched = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.step_results["partition"].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn match_chunks_filters_by_threshold_and_run() {
        let store = test_store().await;
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        let doc = Document {
            id: new_id(),
            run_id: run.id.clone(),
            owner_id: None,
            access_level: AccessLevel::Public,
            filename: "a.pdf".to_string(),
            size_bytes: 10,
            storage_path: "x".to_string(),
            page_count: Some(1),
            document_type: Some(DocumentType::Native),
            status: RunStatus::Running,
            step_results: HashMap::new(),
            metadata: Json::Null,
        };
        store.create_document(&doc).await.unwrap();

        let mut near = vec![0.0f32; EMBEDDING_DIMS];
        near[0] = 1.0;
        let mut far = vec![0.0f32; EMBEDDING_DIMS];
        far[1] = 1.0;

        let chunk_metadata = ChunkMetadata {
            page_number: 1,
            section_title: None,
            bbox: None,
            bbox_confidence: None,
            bbox_multi_page: None,
            element_category: "text".to_string(),
            source_filename: "a.pdf".to_string(),
        };
        let chunks = vec![
            Chunk {
                id: new_id(),
                document_id: doc.id.clone(),
                run_id: run.id.clone(),
                chunk_index: 0,
                content: "near".to_string(),
                embedding: Some(near.clone()),
                metadata: chunk_metadata.clone(),
                created_at: Utc::now(),
            },
            Chunk {
                id: new_id(),
                document_id: doc.id.clone(),
                run_id: run.id.clone(),
                chunk_index: 1,
                content: "far".to_string(),
                embedding: Some(far),
                metadata: chunk_metadata,
                created_at: Utc::now(),
            },
        ];
        store.replace_chunks(&doc.id, &chunks).await.unwrap();

        let results = store
            .match_chunks(&near, 0.9, 10, Some(&run.id), None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.content, "near");
    }
}
