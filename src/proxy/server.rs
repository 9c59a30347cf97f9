use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::modules::api_keys::KeyRegistry;
use crate::proxy::config::ProxyConfig;
use crate::proxy::rate_limit::RateLimiter;
use crate::proxy::security::SecurityGuard;
use crate::proxy::token_manager::TokenManager;
use crate::proxy::upstream::UpstreamClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 请求统计
#[derive(Default)]
pub struct RequestStats {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    auth_failed: AtomicU64,
    rate_limited: AtomicU64,
    blocked: AtomicU64,
}

impl RequestStats {
    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "total_requests": self.total.load(Ordering::Relaxed),
            "successful_requests": self.success.load(Ordering::Relaxed),
            "failed_requests": self.failed.load(Ordering::Relaxed),
            "auth_failures": self.auth_failed.load(Ordering::Relaxed),
            "rate_limited": self.rate_limited.load(Ordering::Relaxed),
            "blocked": self.blocked.load(Ordering::Relaxed),
        })
    }
}

/// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub token_manager: Arc<TokenManager>,
    pub key_registry: Arc<KeyRegistry>,
    pub guard: Arc<SecurityGuard>,
    pub ip_limiter: Arc<RateLimiter>,
    pub key_limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
    pub stats: Arc<RequestStats>,
}

/// Axum server instance
pub struct AxumServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AxumServer {
    /// Start Axum server
    pub async fn start(
        host: String,
        port: u16,
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let static_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("static");

        let app = Router::new()
            .route("/", get(root_handler))
            .route("/v1", get(api_info_handler))
            // OpenAI Protocol
            .route("/v1/models", get(crate::proxy::handlers::openai::handle_list_models))
            .route(
                "/v1/chat/completions",
                post(crate::proxy::handlers::openai::handle_chat_completions),
            )
            .route("/stats", get(stats_handler))
            .route("/healthz", get(health_check_handler))
            .route("/test", get(test_page_handler))
            // Static assets go through the same middleware stack so the
            // security guard sees scanner probes against unknown paths.
            .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
            .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                crate::proxy::middleware::admission_middleware,
            ))
            .layer(cors_layer())
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        // Bind address
        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind address {}: {}", addr, e))?;

        tracing::info!("Reverse proxy server started at http://{}", addr);

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            let serve = axum::serve(listener, service).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
                tracing::info!("Reverse proxy server stopped listening");
            });
            if let Err(e) = serve.await {
                error!("Server error: {:?}", e);
            }
        });

        Ok((
            Self {
                shutdown_tx: Some(shutdown_tx),
            },
            handle,
        ))
    }

    /// Stop the server
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// API 根路径
async fn root_handler() -> Response {
    Json(serde_json::json!({
        "name": "unlimited-proxy",
        "version": VERSION,
        "status": "ok",
    }))
    .into_response()
}

async fn api_info_handler() -> Response {
    Json(serde_json::json!({
        "version": VERSION,
        "status": "ok",
    }))
    .into_response()
}

/// 测试客户端页面 - 重定向
async fn test_page_handler() -> Redirect {
    Redirect::permanent("/client.html")
}

/// Health check handler
async fn health_check_handler(State(state): State<AppState>) -> Response {
    let available = state.token_manager.available();
    let token_status = if available > 0 { "ok" } else { "cold" };

    Json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
        "components": {
            "token_pool": token_status,
        },
    }))
    .into_response()
}

/// 使用统计
async fn stats_handler(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp(),
        "request_stats": state.stats.snapshot(),
        "token_pool": {
            "size": state.token_manager.pool_size(),
            "available": state.token_manager.available(),
            "acquisitions": state.token_manager.acquisition_count(),
        },
        "security": {
            "active_bans": state.guard.ban_count(),
            "tracked_ips": state.ip_limiter.tracked_subjects(),
            "tracked_keys": state.key_limiter.tracked_subjects(),
        },
    }))
    .into_response()
}
