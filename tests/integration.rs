use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn byggeviden_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("byggeviden");
    path
}

/// Lays out a throwaway project root with a JSON config pointing at a
/// scratch SQLite file and object store directory. LLM-backed commands
/// (`index`, `query`, `wiki generate`, `checklist analyze`) need a running
/// chat/embedding endpoint and are exercised at the unit level elsewhere;
/// this harness covers the pieces of the CLI that don't require one.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("objects")).unwrap();

    let config_content = serde_json::json!({
        "db": { "path": root.join("data").join("byggeviden.sqlite") },
        "defaults": {
            "embedding_model": "voyage-multilingual-2",
            "embedding_dims": 1024,
            "chunk_target_chars": 1000,
            "chunk_overlap_chars": 200,
            "chunk_max_chars": 1200,
            "chunk_min_chars": 100,
            "retrieval_top_k": 10,
            "similarity_floor": 0.3,
            "embedding_batch_size": 64,
            "max_retries": 5,
            "timeout_secs": 30
        },
        "indexing": {},
        "query": {},
        "wiki": { "regenerate_on_rerun": false },
        "server": { "bind": "127.0.0.1:0" },
        "object_store": { "root": root.join("objects") },
        "llm": {
            "chat_model": "gpt-4o",
            "vision_model": "gpt-4o",
            "base_url": "http://127.0.0.1:1",
            "ocr_base_url": "http://127.0.0.1:1"
        }
    });

    let config_path = config_dir.join("byggeviden.json");
    fs::write(&config_path, serde_json::to_string_pretty(&config_content).unwrap()).unwrap();

    (tmp, config_path)
}

fn run_byggeviden(config_path: &PathBuf, args: &[&str]) -> (String, String, bool) {
    let binary = byggeviden_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("LLM_API_KEY", "test-key-unused")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run byggeviden binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_byggeviden(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr1, success1) = run_byggeviden(&config_path, &["init"]);
    assert!(success1, "first init failed: {}", stderr1);

    let (_, stderr2, success2) = run_byggeviden(&config_path, &["init"]);
    assert!(success2, "second init failed (not idempotent): {}", stderr2);
}

#[test]
fn test_init_creates_sqlite_file_on_disk() {
    let (tmp, config_path) = setup_test_env();

    run_byggeviden(&config_path, &["init"]);
    let db_path = tmp.path().join("data").join("byggeviden.sqlite");
    assert!(db_path.exists(), "database file should exist after init");
}

#[test]
fn test_index_with_missing_file_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_byggeviden(&config_path, &["init"]);
    let (_, stderr, success) = run_byggeviden(&config_path, &["index", "no-such-file.pdf"]);
    assert!(!success, "indexing a nonexistent file should fail");
    assert!(!stderr.is_empty());
}

#[test]
fn test_query_against_unknown_run_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_byggeviden(&config_path, &["init"]);
    let (_, stderr, success) = run_byggeviden(
        &config_path,
        &["query", "what is the foundation depth?", "--run-id", "nonexistent-run"],
    );
    assert!(!success, "querying a nonexistent run should fail");
    assert!(
        stderr.to_lowercase().contains("not found"),
        "expected a not-found error, got: {}",
        stderr
    );
}

#[test]
fn test_wiki_generate_against_unknown_run_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_byggeviden(&config_path, &["init"]);
    let (_, stderr, success) = run_byggeviden(
        &config_path,
        &["wiki", "generate", "--run-id", "nonexistent-run"],
    );
    assert!(!success, "generating a wiki for a nonexistent run should fail");
    assert!(
        stderr.to_lowercase().contains("not found"),
        "expected a not-found error, got: {}",
        stderr
    );
}

#[test]
fn test_checklist_analyze_missing_file_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_byggeviden(&config_path, &["init"]);
    let (_, stderr, success) = run_byggeviden(
        &config_path,
        &["checklist", "analyze", "--run-id", "some-run", "no-such-checklist.txt"],
    );
    assert!(!success, "analyzing a missing checklist file should fail");
    assert!(!stderr.is_empty());
}

#[test]
fn test_missing_config_file_fails_with_clear_error() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("config").join("byggeviden.json");

    let (_, stderr, success) = run_byggeviden(&missing, &["init"]);
    assert!(!success, "init with a missing config file should fail");
    assert!(
        stderr.contains("config") || stderr.contains("Failed to read"),
        "expected a config-read error, got: {}",
        stderr
    );
}
