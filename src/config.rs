use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// A named, typed root for ingestion (the `Source` of the data model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl SourceConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Markdown,
    Code,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub target: usize,
    pub max: usize,
    pub min: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target: 1000,
            max: 2000,
            min: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub batch_size: usize,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Vector dimensionality for the configured model. `text-embedding-3-small`
    /// is 1536-dimensional; override for other models.
    #[serde(default = "default_embedding_dim")]
    pub dimensions: usize,
}

fn default_embedding_dim() -> usize {
    1536
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            batch_size: 100,
            api_key: None,
            endpoint: None,
            dimensions: default_embedding_dim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub enabled: bool,
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "ms-marco-TinyBERT-L-2-v2".to_string(),
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub enabled: bool,
    pub debounce_seconds: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_seconds: 30,
        }
    }
}

/// The structured sidecar file (`vault-search.toml`). Loaded first; individual
/// scalar fields may then be overridden by environment variables so the same
/// config file can be reused across environments (dev/CI/prod) with secrets
/// injected via env.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub vector_store_path: Option<String>,
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    #[serde(default)]
    pub rerank: Option<RerankConfig>,
    #[serde(default)]
    pub chunk: Option<ChunkConfig>,
    #[serde(default)]
    pub watch: Option<WatchConfig>,
    #[serde(default)]
    pub index_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: String,
    pub vector_store_path: String,
    pub sources: Vec<SourceConfig>,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub chunk: ChunkConfig,
    pub watch: WatchConfig,
    /// Concurrency ceiling for cross-file indexing (default 4-8, bounds embedding-API concurrency).
    pub index_concurrency: usize,
    pub max_file_size_bytes: usize,
}

impl AppConfig {
    /// Loads the structured sidecar file (if present), then lets a handful of
    /// environment variables override specific scalars. Precedence: TOML < env.
    pub fn from_env() -> Self {
        let config_path = std::env::var("VAULT_SEARCH_CONFIG")
            .unwrap_or_else(|_| "vault-search.toml".to_string());
        let file = load_file_config(Path::new(&config_path));

        let port = std::env::var("VAULT_SEARCH_PORT").unwrap_or_else(|_| "9721".to_string());

        let data_dir = std::env::var("VAULT_SEARCH_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("vault-search").to_string_lossy().to_string())
                .unwrap_or_else(|| ".vault-search-data".to_string())
        });

        let vector_store_path = std::env::var("VAULT_SEARCH_VECTOR_STORE_PATH")
            .ok()
            .or(file.vector_store_path.clone())
            .unwrap_or_else(|| PathBuf::from(&data_dir).join("vectors").to_string_lossy().to_string());

        let mut embedding = file.embedding.clone().unwrap_or_default();
        if let Ok(model) = std::env::var("VAULT_SEARCH_EMBEDDING_MODEL") {
            embedding.model = model;
        }
        if let Ok(key) = std::env::var("VAULT_SEARCH_EMBEDDING_API_KEY") {
            embedding.api_key = Some(key);
        }
        if let Ok(endpoint) = std::env::var("VAULT_SEARCH_EMBEDDING_ENDPOINT") {
            embedding.endpoint = Some(endpoint);
        }

        let mut rerank = file.rerank.clone().unwrap_or_default();
        if let Ok(enabled) = std::env::var("VAULT_SEARCH_RERANK_ENABLED") {
            rerank.enabled = enabled.parse().unwrap_or(rerank.enabled);
        }
        if let Ok(endpoint) = std::env::var("VAULT_SEARCH_RERANK_ENDPOINT") {
            rerank.endpoint = Some(endpoint);
        }

        let chunk = file.chunk.clone().unwrap_or_default();
        let watch = file.watch.clone().unwrap_or_default();

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            data_dir,
            vector_store_path,
            sources: file.sources.clone(),
            embedding,
            rerank,
            chunk,
            watch,
            index_concurrency: std::env::var("VAULT_SEARCH_INDEX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.index_concurrency)
                .unwrap_or(6),
            max_file_size_bytes: std::env::var("VAULT_SEARCH_MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 1024 * 1024),
        }
    }
}

fn load_file_config(path: &Path) -> FileConfig {
    match std::fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
            warn!("failed to parse {}: {e}; using defaults", path.display());
            FileConfig::default()
        }),
        Err(_) => FileConfig::default(),
    }
}

/// Directory names excluded from source discovery regardless of per-source globs.
pub fn is_excluded_directory(name: &str) -> bool {
    const BUILD_DIRS: &[&str] = &[
        "node_modules",
        "target",
        "dist",
        "build",
        ".git",
        ".hg",
        ".svn",
        "__pycache__",
        ".venv",
        "venv",
        ".next",
        ".cache",
    ];
    BUILD_DIRS.contains(&name)
}
