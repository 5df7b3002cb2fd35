use crate::config::AppConfig;
use crate::embedder::{Embedder, RemoteEmbedder};
use crate::error::AppResult;
use crate::indexer::Indexer;
use crate::link_analytics::LinkAnalytics;
use crate::query::QueryService;
use crate::reranker::{RemoteReranker, Reranker};
use crate::repository::VectorRepository;
use crate::source::SourceRegistry;
use crate::tokenizer;
use crate::watcher::FileWatcherManager;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Events broadcast to all connected WebSocket clients.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "file_changed")]
    FileChanged {
        source_id: String,
        path: String,
        change_type: String,
    },
    #[serde(rename = "file_indexed")]
    FileIndexed {
        source_id: String,
        path: String,
        chunks: usize,
    },
    #[serde(rename = "reindex_started")]
    ReindexStarted,
    #[serde(rename = "reindex_complete")]
    ReindexCompleted {
        processed: usize,
        chunks_created: usize,
        duration_ms: u64,
    },
    #[serde(rename = "reindex_error")]
    ReindexError { source_id: String, path: String, error: String },
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub sources: Arc<SourceRegistry>,
    pub repo: Arc<VectorRepository>,
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub indexer: Arc<Indexer>,
    pub watcher: Arc<FileWatcherManager>,
    pub query_service: Arc<QueryService>,
    pub link_analytics: Arc<LinkAnalytics>,
    pub event_tx: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let (event_tx, _) = broadcast::channel(1024);

        let data_dir = std::path::PathBuf::from(&config.data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(crate::error::AppError::Io)?;

        let sources = Arc::new(SourceRegistry::new(&config.sources)?);

        let repo = Arc::new(VectorRepository::open(
            std::path::Path::new(&config.vector_store_path),
            config.embedding.dimensions,
            &config.embedding.model,
        )?);

        let embedder: Arc<dyn Embedder> = Arc::new(RemoteEmbedder::new(
            config.embedding.model.clone(),
            config.embedding.api_key.clone(),
            config.embedding.endpoint.clone(),
            config.embedding.dimensions,
        )?);

        let reranker: Option<Arc<dyn Reranker>> = if config.rerank.enabled {
            Some(Arc::new(RemoteReranker::new(
                config.rerank.model.clone(),
                config.rerank.endpoint.clone(),
            )?))
        } else {
            None
        };

        let counter = tokenizer::default_counter();

        let indexer = Arc::new(Indexer::new(
            sources.clone(),
            repo.clone(),
            embedder.clone(),
            counter.clone(),
            config.chunk.clone(),
            config.embedding.batch_size,
            config.index_concurrency,
        ));

        let watcher = Arc::new(FileWatcherManager::new(
            indexer.clone(),
            sources.clone(),
            std::time::Duration::from_secs(config.watch.debounce_seconds),
            event_tx.clone(),
        ));
        if config.watch.enabled && !sources.is_empty() {
            watcher.start().map_err(|e| {
                crate::error::AppError::Internal(anyhow::anyhow!("failed to start file watcher: {e}"))
            })?;
        }

        let query_service = Arc::new(QueryService::new(repo.clone(), embedder.clone(), reranker.clone()));

        let link_analytics = Arc::new(LinkAnalytics::new(
            sources.clone(),
            repo.clone(),
            embedder.clone(),
            counter.clone(),
            config.chunk.clone(),
        ));

        info!(
            sources = sources.iter().count(),
            watch_enabled = config.watch.enabled,
            rerank_enabled = config.rerank.enabled,
            "vault-search initialized"
        );

        Ok(Self {
            config,
            sources,
            repo,
            embedder,
            reranker,
            indexer,
            watcher,
            query_service,
            link_analytics,
            event_tx,
        })
    }
}
