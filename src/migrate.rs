//! Database schema migrations.
//!
//! Creates all tables for the entities in §3.1 plus the chunk-vector blob
//! table that backs the in-memory HNSW index built at store startup (C2).
//! Idempotent: every statement uses `CREATE TABLE IF NOT EXISTS`. Run via
//! `byggeviden init`.

use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run_migrations_on(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn run_migrations_on(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            access_level TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexing_runs (
            id TEXT PRIMARY KEY,
            upload_type TEXT NOT NULL,
            owner_id TEXT,
            project_id TEXT,
            status TEXT NOT NULL,
            access_level TEXT NOT NULL,
            step_results TEXT NOT NULL DEFAULT '{}',
            pipeline_config TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            error_message TEXT,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            owner_id TEXT,
            access_level TEXT NOT NULL,
            filename TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            storage_path TEXT NOT NULL,
            page_count INTEGER,
            document_type TEXT,
            status TEXT NOT NULL,
            step_results TEXT NOT NULL DEFAULT '{}',
            metadata TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (run_id) REFERENCES indexing_runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Many-to-many between runs and documents, allowing reprocessing without
    // duplicating storage (§3.1 "Run-Document Link").
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_document_links (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            UNIQUE(run_id, document_id),
            FOREIGN KEY (run_id) REFERENCES indexing_runs(id),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id),
            FOREIGN KEY (run_id) REFERENCES indexing_runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedding vectors stored separately from chunk content so a chunk row
    // can exist pre-embedding (step resume, §4.10) without a nullable BLOB.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wiki_runs (
            id TEXT PRIMARY KEY,
            indexing_run_id TEXT NOT NULL,
            status TEXT NOT NULL,
            access_level TEXT NOT NULL,
            step_results TEXT NOT NULL DEFAULT '{}',
            started_at TEXT NOT NULL,
            completed_at TEXT,
            wiki_structure TEXT NOT NULL DEFAULT '[]',
            error_message TEXT,
            FOREIGN KEY (indexing_run_id) REFERENCES indexing_runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wiki_page_metadata (
            id TEXT PRIMARY KEY,
            wiki_run_id TEXT NOT NULL,
            title TEXT NOT NULL,
            filename TEXT NOT NULL,
            page_order INTEGER NOT NULL,
            word_count INTEGER NOT NULL,
            storage_path TEXT NOT NULL,
            FOREIGN KEY (wiki_run_id) REFERENCES wiki_runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_runs (
            id TEXT PRIMARY KEY,
            owner_id TEXT,
            indexing_run_id TEXT NOT NULL,
            query_text TEXT NOT NULL,
            variations TEXT NOT NULL DEFAULT '[]',
            search_results TEXT NOT NULL DEFAULT '[]',
            final_response TEXT NOT NULL DEFAULT '',
            step_timings TEXT NOT NULL DEFAULT '{}',
            performance_metrics TEXT NOT NULL DEFAULT '{}',
            access_level TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (indexing_run_id) REFERENCES indexing_runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checklist_analysis_runs (
            id TEXT PRIMARY KEY,
            indexing_run_id TEXT NOT NULL,
            owner_id TEXT,
            checklist_content TEXT NOT NULL,
            model_name TEXT NOT NULL,
            status TEXT NOT NULL,
            raw_output TEXT,
            progress_current INTEGER NOT NULL DEFAULT 0,
            progress_total INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            FOREIGN KEY (indexing_run_id) REFERENCES indexing_runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checklist_results (
            id TEXT PRIMARY KEY,
            analysis_run_id TEXT NOT NULL,
            item_number INTEGER NOT NULL,
            item_name TEXT NOT NULL,
            status TEXT NOT NULL,
            description TEXT NOT NULL,
            confidence_score REAL,
            source_document TEXT,
            source_page INTEGER,
            source_excerpt TEXT,
            all_sources TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (analysis_run_id) REFERENCES checklist_analysis_runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_run_id ON documents(run_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_run_id ON chunks(run_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_run_id ON chunk_vectors(run_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_wiki_page_metadata_wiki_run_id ON wiki_page_metadata(wiki_run_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_query_runs_indexing_run_id ON query_runs(indexing_run_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_checklist_results_analysis_run_id ON checklist_results(analysis_run_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations_on(&pool).await.unwrap();
        run_migrations_on(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='chunks'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }
}
