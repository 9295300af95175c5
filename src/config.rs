//! Configuration loading, precedence merge, and startup validation (C1).
//!
//! Byggeviden is configured via a single JSON document (default:
//! `config/byggeviden.json`) carrying `defaults` plus three pipeline-specific
//! sections (`indexing`, `query`, `wiki`). `ConfigService::get_effective`
//! merges per-request overrides over the pipeline section over defaults,
//! a serde_json::Value-merge technique generalized to three sections
//! instead of one.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub defaults: Defaults,
    #[serde(default)]
    pub indexing: serde_json::Value,
    #[serde(default)]
    pub query: serde_json::Value,
    #[serde(default)]
    pub wiki: serde_json::Value,
    pub server: ServerConfig,
    pub object_store: ObjectStoreConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    pub path: std::path::PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ObjectStoreConfig {
    /// Root directory (or bucket-equivalent) backing the deterministic path
    /// conventions in §6.5.
    pub root: std::path::PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub chat_model: String,
    pub vision_model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ocr_base_url")]
    pub ocr_base_url: String,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ocr_base_url() -> String {
    "http://localhost:8088".to_string()
}

/// The locked invariants of §4.1: failure to hold any of these is a fatal
/// startup error, never a soft warning.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Defaults {
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_chunk_target")]
    pub chunk_target_chars: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap_chars: usize,
    #[serde(default = "default_chunk_max")]
    pub chunk_max_chars: usize,
    #[serde(default = "default_chunk_min")]
    pub chunk_min_chars: usize,
    #[serde(default = "default_top_k")]
    pub retrieval_top_k: i64,
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f64,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_embedding_model() -> String {
    "voyage-multilingual-2".to_string()
}
fn default_embedding_dims() -> usize {
    1024
}
fn default_chunk_target() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_chunk_max() -> usize {
    1200
}
fn default_chunk_min() -> usize {
    100
}
fn default_top_k() -> i64 {
    10
}
fn default_similarity_floor() -> f64 {
    0.3
}
fn default_embedding_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config =
        serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let d = &config.defaults;

    if d.embedding_model != "voyage-multilingual-2" && !d.embedding_model.ends_with("-equivalent") {
        bail!(
            "defaults.embedding_model must be 'voyage-multilingual-2' or an explicitly-marked equivalent, got '{}'",
            d.embedding_model
        );
    }
    if d.embedding_dims != 1024 {
        bail!("defaults.embedding_dims must be 1024, got {}", d.embedding_dims);
    }
    if d.chunk_target_chars != 1000 {
        bail!("defaults.chunk_target_chars must be 1000, got {}", d.chunk_target_chars);
    }
    if d.chunk_overlap_chars != 200 {
        bail!("defaults.chunk_overlap_chars must be 200, got {}", d.chunk_overlap_chars);
    }
    if d.chunk_max_chars != 1200 {
        bail!("defaults.chunk_max_chars must be 1200, got {}", d.chunk_max_chars);
    }
    if d.retrieval_top_k != 10 {
        bail!("defaults.retrieval_top_k must be 10, got {}", d.retrieval_top_k);
    }
    if (d.similarity_floor - 0.3).abs() > f64::EPSILON {
        bail!("defaults.similarity_floor must be 0.3, got {}", d.similarity_floor);
    }

    Ok(())
}

/// Which of the three pipeline-specific config sections to merge over defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Indexing,
    Query,
    Wiki,
}

pub struct ConfigService {
    config: Config,
}

impl ConfigService {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn defaults(&self) -> &Defaults {
        &self.config.defaults
    }

    pub fn raw(&self) -> &Config {
        &self.config
    }

    /// Merges `overrides` over the pipeline-specific section over `defaults`,
    /// and returns the flattened effective configuration as JSON — the form
    /// persisted verbatim into `IndexingRun.pipeline_config` (§4.1).
    pub fn get_effective(&self, pipeline: Pipeline, overrides: Option<&serde_json::Value>) -> Result<serde_json::Value> {
        let mut merged = serde_json::to_value(&self.config.defaults)?;

        let section = match pipeline {
            Pipeline::Indexing => &self.config.indexing,
            Pipeline::Query => &self.config.query,
            Pipeline::Wiki => &self.config.wiki,
        };
        merge_json(&mut merged, section);

        if let Some(overrides) = overrides {
            merge_json(&mut merged, overrides);
        }

        Ok(merged)
    }
}

/// Shallow-to-deep object merge: keys in `patch` overwrite or recurse into `base`.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                merge_json(
                    base_map.entry(key.clone()).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (base_slot, patch_value) => {
            if !patch_value.is_null() {
                *base_slot = patch_value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            db: DbConfig { path: "test.db".into() },
            defaults: Defaults {
                embedding_model: "voyage-multilingual-2".to_string(),
                embedding_dims: 1024,
                chunk_target_chars: 1000,
                chunk_overlap_chars: 200,
                chunk_max_chars: 1200,
                chunk_min_chars: 100,
                retrieval_top_k: 10,
                similarity_floor: 0.3,
                embedding_batch_size: 64,
                max_retries: 5,
                timeout_secs: 30,
            },
            indexing: serde_json::json!({ "embedding_batch_size": 32 }),
            query: serde_json::json!({}),
            wiki: serde_json::json!({ "max_retries": 2 }),
            server: ServerConfig { bind: "127.0.0.1:8080".to_string() },
            object_store: ObjectStoreConfig { root: "/tmp/store".into() },
            llm: LlmConfig {
                chat_model: "gpt-4o".to_string(),
                vision_model: "gpt-4o".to_string(),
                base_url: default_base_url(),
                ocr_base_url: default_ocr_base_url(),
            },
        }
    }

    #[test]
    fn validate_accepts_locked_invariants() {
        assert!(validate(&sample_config()).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_dims() {
        let mut config = sample_config();
        config.defaults.embedding_dims = 768;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn get_effective_merges_pipeline_section() {
        let svc = ConfigService::new(sample_config());
        let effective = svc.get_effective(Pipeline::Indexing, None).unwrap();
        assert_eq!(effective["embedding_batch_size"], 32);
        assert_eq!(effective["chunk_target_chars"], 1000);
    }

    #[test]
    fn get_effective_overrides_win_over_pipeline_section() {
        let svc = ConfigService::new(sample_config());
        let overrides = serde_json::json!({ "embedding_batch_size": 8 });
        let effective = svc.get_effective(Pipeline::Indexing, Some(&overrides)).unwrap();
        assert_eq!(effective["embedding_batch_size"], 8);
    }

    #[test]
    fn get_effective_defaults_when_pipeline_silent() {
        let svc = ConfigService::new(sample_config());
        let effective = svc.get_effective(Pipeline::Query, None).unwrap();
        assert_eq!(effective["retrieval_top_k"], 10);
    }
}
