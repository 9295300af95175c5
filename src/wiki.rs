//! Wiki Generation Orchestrator (C13): six sequential steps from a
//! completed indexing run to a set of cited Markdown pages.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::context::RequestContext;
use crate::error::CoreError;
use crate::llm_client::{ChatMessage, LlmClient};
use crate::models::{
    new_id, AccessLevel, Chunk, UploadType, WikiPageMetadata, WikiPlannedPage, WikiRun,
};
use crate::object_store::{storage_path, ObjectStore, StoragePathKind};
use crate::retrieval::{self, RetrievalRequest};
use crate::store::SqliteStore;

/// Fixed for reproducible clustering across wiki regenerations of the same run.
const CLUSTER_RANDOM_SEED: u64 = 42;
const KMEANS_MAX_ITERATIONS: usize = 50;
const DEFAULT_PAGE_CONCURRENCY: usize = 3;
const OVERVIEW_TARGET_CHARS: usize = 2_500;

/// The ~12 canonical project-identity queries step 2 fans through retrieval.
const OVERVIEW_QUERIES: [&str; 12] = [
    "What is the overall scope of this construction project?",
    "What is the project name and location?",
    "Who are the client, architect, and main contractor?",
    "What building type and structural system is used?",
    "What are the key materials specified?",
    "What is the project timeline and phasing?",
    "What codes and standards does this project comply with?",
    "What are the main mechanical and electrical systems?",
    "What safety and quality requirements are specified?",
    "What is the site context and environmental conditions?",
    "What foundation and structural work is described?",
    "What finishes and envelope systems are specified?",
];

/// Sends a completion notification when a wiki run finishes. Failures are
/// log-only per §6.6 and never fail the enclosing pipeline.
#[async_trait::async_trait]
pub trait WikiNotifier: Send + Sync {
    async fn notify(&self, email: &str, project_name: &str, public_wiki_url: &str);
}

pub struct NoopNotifier;

#[async_trait::async_trait]
impl WikiNotifier for NoopNotifier {
    async fn notify(&self, _email: &str, _project_name: &str, _public_wiki_url: &str) {}
}

struct ClusteredChunk<'a> {
    chunk: &'a Chunk,
    embedding: &'a [f32],
}

fn kmeans_assign(points: &[Vec<f32>], k: usize) -> Vec<usize> {
    if points.is_empty() || k == 0 {
        return Vec::new();
    }
    let k = k.min(points.len());
    let dims = points[0].len();
    let mut rng = StdRng::seed_from_u64(CLUSTER_RANDOM_SEED);

    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|_| points[rng.gen_range(0..points.len())].clone())
        .collect();
    let mut assignments = vec![0usize; points.len()];

    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (i, point) in points.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for (c_idx, centroid) in centroids.iter().enumerate() {
                let dist = euclidean_distance(point, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c_idx;
                }
            }
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }

        let mut sums = vec![vec![0f32; dims]; k];
        let mut counts = vec![0usize; k];
        for (point, &cluster) in points.iter().zip(assignments.iter()) {
            counts[cluster] += 1;
            for (d, value) in point.iter().enumerate() {
                sums[cluster][d] += value;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            for d in 0..dims {
                centroids[c][d] = sums[c][d] / counts[c] as f32;
            }
        }

        if !changed {
            break;
        }
    }

    assignments
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

/// Picks up to 3 chunks per cluster nearest their centroid, for cluster
/// naming.
fn representative_chunks<'a>(
    clustered: &[ClusteredChunk<'a>],
    assignments: &[usize],
    k: usize,
) -> Vec<Vec<&'a Chunk>> {
    let dims = clustered.first().map(|c| c.embedding.len()).unwrap_or(0);
    let mut centroids = vec![vec![0f32; dims]; k];
    let mut counts = vec![0usize; k];
    for (item, &cluster) in clustered.iter().zip(assignments.iter()) {
        counts[cluster] += 1;
        for (d, value) in item.embedding.iter().enumerate() {
            centroids[cluster][d] += value;
        }
    }
    for c in 0..k {
        if counts[c] == 0 {
            continue;
        }
        for d in 0..dims {
            centroids[c][d] /= counts[c] as f32;
        }
    }

    (0..k)
        .map(|cluster_idx| {
            let mut members: Vec<(&Chunk, f32)> = clustered
                .iter()
                .zip(assignments.iter())
                .filter(|(_, &c)| c == cluster_idx)
                .map(|(item, _)| (item.chunk, euclidean_distance(item.embedding, &centroids[cluster_idx])))
                .collect();
            members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            members.into_iter().take(3).map(|(c, _)| c).collect()
        })
        .collect()
}

async fn name_cluster(llm: &LlmClient, request_id: &str, samples: &[&Chunk]) -> String {
    let excerpt: String = samples.iter().map(|c| c.content.as_str()).collect::<Vec<_>>().join("\n---\n");
    let prompt = format!(
        "These excerpts come from the same topical cluster in a construction document set. \
         Give a short (2-5 word) unique section name for this cluster, no punctuation.\n\n{excerpt}"
    );
    llm.chat(request_id, &[ChatMessage::user(prompt)])
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "General Topics".to_string())
}

fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            if seen.insert(name.clone()) {
                name
            } else {
                format!("Cluster {}", i + 1)
            }
        })
        .collect()
}

async fn generate_overview(
    store: &SqliteStore,
    llm: &LlmClient,
    request_id: &str,
    embedding_model: &str,
    run_id: &str,
    ctx: &RequestContext,
) -> Result<String, CoreError> {
    let mut seen_chunks = std::collections::HashSet::new();
    let mut evidence = Vec::new();

    for query in OVERVIEW_QUERIES {
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
            if seen_chunks.insert(result.chunk_id.clone()) {
                evidence.push(result);
            }
        }
    }

    let context_block = evidence
        .iter()
        .map(|r| format!("{}: {}", r.source_filename, r.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let prompt = format!(
        "Using only the following excerpts from a construction project's documentation, write \
         a roughly {OVERVIEW_TARGET_CHARS}-character project overview. Cite source filenames \
         inline in parentheses.\n\n{context_block}"
    );
    llm.chat(request_id, &[ChatMessage::user(prompt)]).await
}

async fn generate_structure(
    llm: &LlmClient,
    request_id: &str,
    overview: &str,
    cluster_names: &[String],
) -> Result<Vec<WikiPlannedPage>, CoreError> {
    let clusters_block = cluster_names.join(", ");
    let prompt = format!(
        "Project overview:\n{overview}\n\nTopic clusters found in the documentation: {clusters_block}\n\n\
         Produce a JSON array of wiki pages for this project, each with fields \
         `id`, `title`, `description`, `queries` (an array of retrieval queries for this page), \
         and `relevance_score` (0.0-1.0). Return only the JSON array."
    );
    let response = llm.chat(request_id, &[ChatMessage::user(prompt)]).await?;
    let json_start = response.find('[').unwrap_or(0);
    let json_end = response.rfind(']').map(|i| i + 1).unwrap_or(response.len());
    let slice = &response[json_start..json_end];

    #[derive(serde::Deserialize)]
    struct RawPage {
        id: Option<String>,
        title: String,
        description: String,
        #[serde(default)]
        queries: Vec<String>,
        #[serde(default)]
        relevance_score: f64,
    }

    let raw: Vec<RawPage> = serde_json::from_str(slice).map_err(|e| CoreError::Generation(format!(
        "wiki structure response was not valid JSON: {e}"
    )))?;

    Ok(raw
        .into_iter()
        .map(|p| WikiPlannedPage {
            id: p.id.unwrap_or_else(new_id),
            title: p.title,
            description: p.description,
            queries: p.queries,
            relevance_score: p.relevance_score,
        })
        .collect())
}

fn wiki_page_path(run: &crate::models::IndexingRun, wiki_run_id: &str, page_name: &str) -> String {
    match run.upload_type {
        UploadType::Email => storage_path(StoragePathKind::EmailWikiPage {
            run_id: &run.id,
            wiki_run_id,
            page_name,
        }),
        UploadType::UserProject => storage_path(StoragePathKind::ProjectWikiPage {
            owner_id: run.owner_id.as_deref().unwrap_or("unknown"),
            project_id: run.project_id.as_deref().unwrap_or("unknown"),
            run_id: &run.id,
            wiki_run_id,
            page_name,
        }),
    }
}

async fn synthesize_page(
    llm: &LlmClient,
    request_id: &str,
    page: &WikiPlannedPage,
    evidence: &[crate::models::SearchResultRef],
) -> Result<String, CoreError> {
    let context_block = evidence
        .iter()
        .map(|r| format!("{} (p.{}): {}", r.source_filename, r.page_number.unwrap_or(0), r.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = format!(
        "Write a Markdown wiki page titled \"{}\".\nDescription: {}\n\nUsing only the excerpts \
         below, write the page content with inline citations to source filenames and page \
         numbers.\n\n{context_block}",
        page.title, page.description
    );
    llm.chat(request_id, &[ChatMessage::user(prompt)]).await
}

/// Runs the full six-step wiki orchestration for a completed indexing run.
///
/// `regenerate_on_rerun` governs what happens when a completed wiki run
/// already exists for this indexing run: `false` (the default) returns the
/// existing run untouched rather than re-synthesizing every page.
pub async fn generate_wiki(
    store: &SqliteStore,
    llm: &LlmClient,
    object_store: &ObjectStore,
    notifier: &dyn WikiNotifier,
    request_id: &str,
    embedding_model: &str,
    indexing_run_id: &str,
    project_name: &str,
    recipient_email: Option<&str>,
    regenerate_on_rerun: bool,
    ctx: &RequestContext,
) -> Result<WikiRun, CoreError> {
    let run = store.get_run_scoped(indexing_run_id, ctx).await?;

    if !regenerate_on_rerun {
        if let Some(existing) = store.get_latest_completed_wiki_run(indexing_run_id).await? {
            return Ok(existing);
        }
    }

    let mut wiki_run = WikiRun {
        id: new_id(),
        indexing_run_id: indexing_run_id.to_string(),
        status: crate::models::RunStatus::Running,
        access_level: run.access_level,
        step_results: HashMap::new(),
        started_at: chrono::Utc::now(),
        completed_at: None,
        wiki_structure: Vec::new(),
        error_message: None,
    };
    store.create_wiki_run(&wiki_run).await?;

    // Step 1: metadata collection.
    let documents = store.list_documents_by_run(indexing_run_id).await?;
    let mut all_chunks: Vec<Chunk> = Vec::new();
    for document in &documents {
        all_chunks.extend(store.get_chunks_by_document(&document.id).await?);
    }

    // Step 2: overview generation.
    let overview = generate_overview(store, llm, request_id, embedding_model, indexing_run_id, ctx).await?;

    // Step 3: semantic clustering.
    let embedded_chunks: Vec<ClusteredChunk> = all_chunks
        .iter()
        .filter_map(|c| c.embedding.as_deref().map(|e| ClusteredChunk { chunk: c, embedding: e }))
        .collect();

    let k = ((embedded_chunks.len() / 20).clamp(4, 10)).min(embedded_chunks.len().max(1));
    let cluster_names = if embedded_chunks.is_empty() {
        Vec::new()
    } else {
        let points: Vec<Vec<f32>> = embedded_chunks.iter().map(|c| c.embedding.to_vec()).collect();
        let assignments = kmeans_assign(&points, k);
        let representatives = representative_chunks(&embedded_chunks, &assignments, k);

        let names: Vec<String> = stream::iter(representatives.into_iter())
            .then(|samples| async move { name_cluster(llm, request_id, &samples).await })
            .collect()
            .await;
        dedupe_names(names)
    };

    // Step 4: structure generation.
    let planned_pages = generate_structure(llm, request_id, &overview, &cluster_names).await?;
    store.set_wiki_structure(&wiki_run.id, &planned_pages).await?;
    wiki_run.wiki_structure = planned_pages.clone();

    // Steps 5-6: per-page retrieval, Markdown synthesis, and storage,
    // bounded to DEFAULT_PAGE_CONCURRENCY pages in flight.
    let run_ref = &run;
    let page_results: Vec<Result<WikiPageMetadata, CoreError>> = stream::iter(planned_pages.into_iter())
        .map(|page| {
            let wiki_run_id = wiki_run.id.clone();
            async move {
                let mut seen = std::collections::HashSet::new();
                let mut evidence = Vec::new();
                for query in &page.queries {
                    let outcome = retrieval::retrieve(
                        store,
                        llm,
                        request_id,
                        embedding_model,
                        RetrievalRequest {
                            query_text: query,
                            run_id: indexing_run_id,
                            top_k: Some(8),
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

                let markdown = synthesize_page(llm, request_id, &page, &evidence).await?;
                let page_name = slugify(&page.title);
                let path = wiki_page_path(run_ref, &wiki_run_id, &page_name);
                object_store.put_elevated(&path, markdown.as_bytes()).await?;

                Ok(WikiPageMetadata {
                    id: new_id(),
                    wiki_run_id,
                    title: page.title,
                    filename: format!("{page_name}.md"),
                    order: 0,
                    word_count: markdown.split_whitespace().count() as i64,
                    storage_path: path,
                })
            }
        })
        .buffer_unordered(DEFAULT_PAGE_CONCURRENCY)
        .collect()
        .await;

    for (order, result) in page_results.into_iter().enumerate() {
        let mut page_metadata = result?;
        page_metadata.order = order as i64;
        store.create_wiki_page(&page_metadata).await?;
    }

    wiki_run.status = crate::models::RunStatus::Completed;
    wiki_run.completed_at = Some(chrono::Utc::now());
    store
        .update_wiki_run_status(&wiki_run.id, crate::models::RunStatus::Completed, None)
        .await?;

    if run.upload_type == UploadType::Email {
        if let Some(email) = recipient_email {
            let public_url = object_store.signed_url(&wiki_page_path(&run, &wiki_run.id, "index"), 86_400);
            notifier.notify(email, project_name, &public_url).await;
        }
    }

    Ok(wiki_run)
}

fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_lowercases_and_hyphenates() {
        assert_eq!(slugify("Foundation & Structural Work"), "foundation-structural-work");
    }

    #[test]
    fn kmeans_assigns_every_point_to_a_cluster() {
        let points = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![10.0, 10.0],
            vec![10.1, 10.0],
        ];
        let assignments = kmeans_assign(&points, 2);
        assert_eq!(assignments.len(), 4);
        assert_eq!(assignments[0], assignments[1]);
        assert_eq!(assignments[2], assignments[3]);
        assert_ne!(assignments[0], assignments[2]);
    }

    #[test]
    fn dedupe_names_falls_back_on_collision() {
        let names = vec!["Foundations".to_string(), "Foundations".to_string(), "Roofing".to_string()];
        let deduped = dedupe_names(names);
        assert_eq!(deduped[0], "Foundations");
        assert_eq!(deduped[1], "Cluster 2");
        assert_eq!(deduped[2], "Roofing");
    }

    #[test]
    fn kmeans_is_deterministic_across_runs() {
        let points: Vec<Vec<f32>> = (0..20).map(|i| vec![(i % 5) as f32, (i / 5) as f32]).collect();
        let first = kmeans_assign(&points, 4);
        let second = kmeans_assign(&points, 4);
        assert_eq!(first, second);
    }
}
