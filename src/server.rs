use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes — no auth required (health probes only)
    let public_routes = Router::new().route("/health", get(routes::health::health_check));

    // Protected routes — require VAULT_SEARCH_AUTH_TOKEN when configured
    let protected_routes = Router::new()
        // Graceful shutdown (requires auth to prevent unauthorized termination)
        .route("/shutdown", post(routes::health::shutdown_handler))
        // Sources
        .route("/api/sources", get(routes::sources::list_sources))
        // Notes
        .route("/api/notes/read", post(routes::notes::read_note))
        .route("/api/notes/write", post(routes::notes::write_note))
        .route("/api/notes/append", post(routes::notes::append_to_note))
        .route("/api/notes/delete", post(routes::notes::delete_note))
        .route("/api/notes/search", post(routes::notes::search_notes))
        .route("/api/notes/structure", post(routes::notes::get_vault_structure))
        // Indexing & semantic search
        .route("/api/search/semantic", post(routes::search::semantic_search))
        .route("/api/index/reindex", post(routes::search::reindex_vault))
        .route("/api/index/note", post(routes::search::index_note))
        .route("/api/index/stats", get(routes::search::get_index_stats))
        // Link-graph analytics
        .route("/api/links/suggest", post(routes::search::suggest_links))
        .route("/api/links/orphans", get(routes::search::get_orphaned_notes))
        .route("/api/links/most-linked", get(routes::search::get_most_linked_notes))
        .route("/api/links/duplicates", get(routes::search::get_duplicate_content))
        // WebSocket for real-time indexing events
        .route("/ws", get(ws_handler))
        .layer(axum::middleware::from_fn(auth_middleware));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Middleware that validates `Authorization: Bearer <token>` against the
/// `VAULT_SEARCH_AUTH_TOKEN` environment variable. If the env var is not set
/// or empty, auth is skipped (development mode).
async fn auth_middleware(req: Request, next: Next) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    use std::sync::OnceLock;
    static AUTH_TOKEN: OnceLock<Option<String>> = OnceLock::new();
    let expected = AUTH_TOKEN.get_or_init(|| {
        std::env::var("VAULT_SEARCH_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
    });

    let expected_token = match expected {
        Some(t) => t.as_str(),
        None => return Ok(next.run(req).await),
    };

    let auth_header = req.headers().get("authorization").and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header) if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") => {
            let token = &header[7..];
            if token == expected_token {
                Ok(next.run(req).await)
            } else {
                tracing::warn!("auth token mismatch, rejecting request");
                Err((
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
                ))
            }
        }
        _ => {
            tracing::warn!("missing or malformed Authorization header, rejecting request");
            Err((
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
            ))
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Push-only notification stream: broadcasts `ServerEvent`s (indexing
/// progress, reindex lifecycle, file-watcher activity) as JSON to every
/// connected client. There's no per-source subscription model since sources
/// are a small, statically configured set — clients filter client-side if
/// they only care about one.
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("WebSocket client connected");
    let mut rx = state.event_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("WebSocket client lagged, skipped {} events", n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // The client side of this connection has no commands to send; drain and
    // discard incoming frames so the socket stays alive until it closes.
    let mut recv_task = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::info!("WebSocket client disconnected");
}
