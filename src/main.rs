//! # byggeviden CLI
//!
//! Command-line entry point over the indexing orchestrator, retrieval/
//! generation engine, wiki generator, and checklist analyzer.

use std::path::PathBuf;

use byggeviden::config::{self, Config};
use byggeviden::context::RequestContext;
use byggeviden::llm_client::LlmClient;
use byggeviden::models::{new_id, AccessLevel, DocumentInput, IndexingRun, RunStatus, UploadType};
use byggeviden::object_store::{storage_path, ObjectStore, StoragePathKind};
use byggeviden::orchestrator::{self, OrchestratorConfig};
use byggeviden::progress::{ProgressMode, StepProgressEvent};
use byggeviden::store::SqliteStore;
use byggeviden::{checklist, generation, wiki};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "byggeviden",
    about = "Retrieval-augmented indexing and wiki generation for construction-project PDFs",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/byggeviden.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Index a batch of PDFs into a new indexing run
    Index {
        /// PDF files to index
        files: Vec<PathBuf>,

        /// Owner ID for a user-project upload (email uploads omit this)
        #[arg(long)]
        owner_id: Option<String>,

        /// Project ID for a user-project upload
        #[arg(long)]
        project_id: Option<String>,

        /// Treat this as an email upload rather than a user-project upload
        #[arg(long)]
        email_upload: bool,
    },

    /// Ask a question against a completed indexing run
    Query {
        /// The question text
        query: String,

        /// The indexing run to query
        #[arg(long)]
        run_id: String,

        /// Maximum number of cited chunks
        #[arg(long)]
        top_k: Option<i64>,
    },

    /// Wiki generation
    Wiki {
        #[command(subcommand)]
        action: WikiAction,
    },

    /// Checklist analysis
    Checklist {
        #[command(subcommand)]
        action: ChecklistAction,
    },

    /// Start the HTTP API
    Serve,
}

#[derive(Subcommand)]
enum WikiAction {
    /// Generate a project wiki from a completed indexing run
    Generate {
        #[arg(long)]
        run_id: String,

        #[arg(long, default_value = "Untitled Project")]
        project_name: String,

        #[arg(long)]
        recipient_email: Option<String>,
    },
}

#[derive(Subcommand)]
enum ChecklistAction {
    /// Analyze a checklist file against a completed indexing run
    Analyze {
        #[arg(long)]
        run_id: String,

        /// Path to the checklist text file
        checklist_file: PathBuf,

        #[arg(long)]
        model_name: Option<String>,
    },
}

async fn wire_dependencies(cfg: &Config) -> anyhow::Result<(SqliteStore, LlmClient, ObjectStore)> {
    let pool = byggeviden::db::connect(cfg).await?;
    let llm = LlmClient::new(
        cfg.llm.clone(),
        std::env::var("LLM_API_KEY")?,
        cfg.defaults.max_retries,
        cfg.defaults.timeout_secs,
    )?;
    let object_store = ObjectStore::new(&cfg.object_store.root);
    Ok((SqliteStore::new(pool), llm, object_store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            byggeviden::migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }

        Commands::Index {
            files,
            owner_id,
            project_id,
            email_upload,
        } => {
            let (store, llm, object_store) = wire_dependencies(&cfg).await?;
            let upload_type = if email_upload { UploadType::Email } else { UploadType::UserProject };
            let access_level = match upload_type {
                UploadType::Email => AccessLevel::Public,
                UploadType::UserProject => AccessLevel::Private,
            };

            let run = IndexingRun::new(new_id(), upload_type, owner_id.clone(), project_id.clone(), access_level);
            store.create_run(&run).await?;

            let mut documents = Vec::with_capacity(files.len());
            for path in &files {
                let bytes = tokio::fs::read(path).await?;
                let document_id = new_id();
                let filename = path
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| document_id.clone());
                let dest = match upload_type {
                    UploadType::Email => storage_path(StoragePathKind::EmailPdf {
                        run_id: &run.id,
                        doc_id: &document_id,
                    }),
                    UploadType::UserProject => storage_path(StoragePathKind::ProjectPdf {
                        owner_id: owner_id.as_deref().unwrap_or("unknown"),
                        project_id: project_id.as_deref().unwrap_or("unknown"),
                        run_id: &run.id,
                        doc_id: &document_id,
                    }),
                };
                object_store.put_elevated(&dest, &bytes).await?;

                let document = byggeviden::models::Document {
                    id: document_id.clone(),
                    run_id: run.id.clone(),
                    owner_id: owner_id.clone(),
                    access_level,
                    filename: filename.clone(),
                    size_bytes: bytes.len() as i64,
                    storage_path: dest.clone(),
                    page_count: None,
                    document_type: None,
                    status: RunStatus::Pending,
                    step_results: Default::default(),
                    metadata: serde_json::json!({}),
                };
                store.create_document(&document).await?;
                documents.push(DocumentInput {
                    document_id,
                    storage_path: dest,
                    filename,
                    owner_id: owner_id.clone(),
                    access_level,
                });
            }

            let reporter = ProgressMode::default_for_tty().reporter();
            reporter.report(StepProgressEvent::RunProgress {
                run_id: run.id.clone(),
                n: 0,
                total: documents.len() as u64,
            });

            let orchestrator_config = OrchestratorConfig {
                embedding_model: cfg.defaults.embedding_model.clone(),
                ..OrchestratorConfig::default()
            };
            let outcome = orchestrator::run_indexing(
                &store,
                &llm,
                None,
                &object_store,
                &orchestrator_config,
                &run.id,
                upload_type,
                &documents,
            )
            .await?;

            println!("run {} finished with status {:?}", outcome.run_id, outcome.status);
        }

        Commands::Query { query, run_id, top_k } => {
            let (store, llm, _object_store) = wire_dependencies(&cfg).await?;
            let ctx = RequestContext::anonymous();
            let request_id = new_id();
            let result = generation::answer_query(
                &store,
                &llm,
                &request_id,
                &cfg.defaults.embedding_model,
                &query,
                &run_id,
                top_k,
                &ctx,
            )
            .await?;
            println!("{}", result.answer);
            for (i, citation) in result.citations.iter().enumerate() {
                println!("[{}] {} (p.{:?})", i + 1, citation.source_filename, citation.page_number);
            }
        }

        Commands::Wiki { action } => match action {
            WikiAction::Generate {
                run_id,
                project_name,
                recipient_email,
            } => {
                let (store, llm, object_store) = wire_dependencies(&cfg).await?;
                let ctx = RequestContext::anonymous();
                let request_id = new_id();
                let wiki_run = wiki::generate_wiki(
                    &store,
                    &llm,
                    &object_store,
                    &wiki::NoopNotifier,
                    &request_id,
                    &cfg.defaults.embedding_model,
                    &run_id,
                    &project_name,
                    recipient_email.as_deref(),
                    cfg.wiki.get("regenerate_on_rerun").and_then(|v| v.as_bool()).unwrap_or(false),
                    &ctx,
                )
                .await?;
                println!("wiki run {} completed with {} planned pages", wiki_run.id, wiki_run.wiki_structure.len());
            }
        },

        Commands::Checklist { action } => match action {
            ChecklistAction::Analyze {
                run_id,
                checklist_file,
                model_name,
            } => {
                let (store, llm, _object_store) = wire_dependencies(&cfg).await?;
                let ctx = RequestContext::anonymous();
                let request_id = new_id();
                let content = tokio::fs::read_to_string(&checklist_file).await?;
                let model_name = model_name.unwrap_or_else(|| cfg.llm.chat_model.clone());
                let run = checklist::analyze_checklist(
                    &store,
                    &llm,
                    &request_id,
                    &cfg.defaults.embedding_model,
                    &run_id,
                    None,
                    &content,
                    &model_name,
                    &ctx,
                )
                .await?;
                println!("checklist analysis {} completed with {} results", run.id, run.results.len());
                for result in &run.results {
                    println!("  [{}] {} — {:?}", result.item_number, result.item_name, result.status);
                }
            }
        },

        Commands::Serve => {
            byggeviden::server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
