//! Engine configuration (spec.md §6), loaded from `neurostore.toml`.
//!
//! Grounded on `crates/engine/src/database/config.rs` (`StrataConfig`):
//! a `serde`+`toml` struct with `Default`, eager validation, and a
//! `write_default_if_missing` helper, replacing the teacher's builder
//! pattern.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::limits::Limits;

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "neurostore.toml";

/// HNSW persistence strategy (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Every `save_node` flushes to storage immediately.
    Immediate,
    /// Nodes are marked dirty and flushed on `flush()`/`close()`/threshold.
    Deferred,
}

/// HNSW index tuning (spec.md §4.9, bounds in spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Max connections per node per level (non-entry layer).
    #[serde(default = "default_m")]
    pub m: usize,
    /// Build-time beam width.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    /// Query-time beam width.
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
}

fn default_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    50
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
        }
    }
}

impl IndexConfig {
    /// Validate `m`/`ef_construction`/`ef_search` are within spec.md §6
    /// bounds. Called eagerly by [`EngineConfig::validate`].
    pub fn validate(&self) -> Result<()> {
        Limits::check_m(self.m)?;
        Limits::check_ef(self.ef_construction, "ef_construction")?;
        Limits::check_ef(self.ef_search, "ef_search")?;
        Ok(())
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StorageBackendConfig {
    /// In-memory backend, data is lost on process exit.
    Memory,
    /// Local filesystem backend rooted at `path`.
    LocalFs {
        /// Root directory for the storage tree (spec.md §4.6 layout).
        path: String,
    },
}

impl Default for StorageBackendConfig {
    fn default() -> Self {
        StorageBackendConfig::Memory
    }
}

/// Recognized configuration options (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageBackendConfig,
    /// Active branch on open (default `"main"`).
    #[serde(default = "default_branch")]
    pub branch: String,
    /// HNSW tuning.
    #[serde(default)]
    pub index: IndexConfig,
    /// Vector distance metric (spec.md §6, default cosine).
    #[serde(default)]
    pub distance: DistanceMetric,
    /// HNSW persistence strategy. `None` means "derive from storage kind"
    /// (cloud -> deferred, local -> immediate), per spec.md §4.9.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceMode>,
    /// Warm up the embedder on init.
    #[serde(default)]
    pub eager_embeddings: bool,
    /// Memory-aware bound on `find`/`similar` result limits.
    #[serde(default = "default_max_query_limit")]
    pub max_query_limit: usize,
    /// Reserved memory budget hint for query execution, in bytes.
    #[serde(default)]
    pub reserved_query_memory: Option<u64>,
    /// Suppress non-error logging.
    #[serde(default)]
    pub silent: bool,
    /// Emit extra diagnostic logging.
    #[serde(default)]
    pub verbose: bool,
    /// Skip index rebuild at init; rebuild lazily on first query instead.
    #[serde(default)]
    pub disable_auto_rebuild: bool,
    /// Enable write buffering/coalescing for cloud-style backends.
    #[serde(default)]
    pub batch_writes: bool,
    /// Backpressure soft cap on concurrent in-flight backend operations.
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,
    /// Closed set of noun-type names (spec.md §3: "closed enumeration").
    #[serde(default = "default_noun_types")]
    pub noun_types: Vec<String>,
    /// Closed set of verb-type names.
    #[serde(default = "default_verb_types")]
    pub verb_types: Vec<String>,
    /// Noun vector dimensionality. `None` until the first insert fixes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_max_query_limit() -> usize {
    1000
}
fn default_max_concurrent_operations() -> usize {
    64
}
fn default_noun_types() -> Vec<String> {
    vec!["PERSON".into(), "PLACE".into(), "THING".into(), "EVENT".into()]
}
fn default_verb_types() -> Vec<String> {
    vec!["RELATED_TO".into(), "KNOWS".into(), "PART_OF".into()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackendConfig::default(),
            branch: default_branch(),
            index: IndexConfig::default(),
            distance: DistanceMetric::default(),
            persistence: None,
            eager_embeddings: false,
            max_query_limit: default_max_query_limit(),
            reserved_query_memory: None,
            silent: false,
            verbose: false,
            disable_auto_rebuild: false,
            batch_writes: false,
            max_concurrent_operations: default_max_concurrent_operations(),
            noun_types: default_noun_types(),
            verb_types: default_verb_types(),
            dimension: None,
        }
    }
}

impl EngineConfig {
    /// Validate every recognized option. Invalid config values MUST fail
    /// `init`, never be silently clamped (spec.md §6).
    pub fn validate(&self) -> Result<()> {
        self.index.validate()?;
        if self.branch.is_empty() || self.branch.len() > Limits::MAX_BRANCH_NAME_LEN {
            return Err(Error::ValidationError(format!(
                "invalid branch name: {:?}",
                self.branch
            )));
        }
        if self.max_query_limit == 0 {
            return Err(Error::ValidationError(
                "max_query_limit must be > 0".into(),
            ));
        }
        if self.max_concurrent_operations == 0 {
            return Err(Error::ValidationError(
                "max_concurrent_operations must be > 0".into(),
            ));
        }
        if self.noun_types.is_empty() {
            return Err(Error::ValidationError(
                "noun_types must be non-empty".into(),
            ));
        }
        if self.verb_types.is_empty() {
            return Err(Error::ValidationError(
                "verb_types must be non-empty".into(),
            ));
        }
        if let Some(d) = self.dimension {
            Limits::check_dimension(d)?;
        }
        Ok(())
    }

    /// Read and parse config from a file path, validating eagerly.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| Error::ValidationError(format!("failed to parse {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config to `path` if no file exists there yet.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            let default = Self::default();
            let content = toml::to_string_pretty(&default)
                .map_err(|e| Error::Fatal(format!("failed to serialize default config: {e}")))?;
            std::fs::write(path, content)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_m_fails_validation() {
        let mut cfg = EngineConfig::default();
        cfg.index.m = 0;
        assert!(cfg.validate().is_err());
        cfg.index.m = 5000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn write_default_if_missing_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        EngineConfig::write_default_if_missing(&path).unwrap();
        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.branch, "main");
    }
}
