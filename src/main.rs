use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod chunker;
mod config;
mod embedder;
mod error;
mod hash;
mod indexer;
mod link_analytics;
mod metadata;
mod query;
mod reranker;
mod repository;
mod routes;
mod server;
mod source;
mod state;
mod tokenizer;
mod watcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Resolve log directory (same parent as data_dir or from env)
    let log_dir = std::env::var("VAULT_SEARCH_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("vault-search").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".vault-search-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files
    let file_appender = tracing_appender::rolling::daily(&log_dir, "vault-search.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vault_search=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Install panic hook that logs before aborting
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "vault_search::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    let config = config::AppConfig::from_env();
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        vector_store_path = %config.vector_store_path,
        sources = config.sources.len(),
        watch_enabled = config.watch.enabled,
        rerank_enabled = config.rerank.enabled,
        index_concurrency = config.index_concurrency,
        max_file_size_bytes = config.max_file_size_bytes,
        log_dir = %log_dir,
        "vault-search starting"
    );

    let app_state = state::AppState::new(config).await?;

    routes::health::init_shutdown_notify();

    // Reconcile stale chunks left over from a previous run before accepting
    // any traffic, so an initial query never returns ghost results for files
    // deleted while the process was down.
    if let Err(e) = app_state.indexer.reconcile().await {
        tracing::warn!("startup reconciliation failed: {e}");
    }

    let app = server::create_app(app_state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("vault-search listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("vault-search shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install secondary Ctrl+C handler");
    };

    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("received HTTP shutdown request, initiating shutdown"); },
    }

    info!("shutdown signal received");
}
