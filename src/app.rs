use crate::cache::CacheGate;
use crate::config::{GatewayConfig, env_non_empty};
use crate::error::{AppError, AppResult};
use crate::providers::ProviderSet;
use crate::request::{MAX_IMAGE_BYTES, MAX_IMAGES};
use crate::store::{
    BlobStore, ChatIndex, KvStore, MemoryBlobStore, MemoryChatIndex, MemoryKvStore, SqliteBlobStore,
    SqliteChatIndex, SqliteKvStore, ensure_sqlite_file,
};
use crate::transcript::TranscriptPersister;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Leaves room for a few images beyond the count ceiling, each base64-inflated at the per-image
/// ceiling, so an oversized batch still reaches the image-count check.
const MAX_BODY_BYTES: usize = (MAX_IMAGES + 6) * MAX_IMAGE_BYTES / 3 * 4 + 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub providers: Arc<ProviderSet>,
    pub cache: CacheGate,
    pub transcripts: TranscriptPersister,
}

impl AppState {
    pub fn stream_idle_timeout(&self) -> Duration {
        self.runtime.gateway.stream_idle_timeout()
    }
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub gateway: GatewayConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen =
            env_non_empty("CHATROUTER_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_non_empty("CHATROUTER_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = resolve_database_dsn();
        Self {
            listen,
            metrics_path,
            database_dsn,
            gateway: GatewayConfig::from_env(),
        }
    }
}

/// The three external storage services the pipeline writes to.
#[derive(Clone)]
pub struct Stores {
    pub kv: Arc<dyn KvStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub index: Arc<dyn ChatIndex>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            kv: Arc::new(MemoryKvStore::default()),
            blobs: Arc::new(MemoryBlobStore::default()),
            index: Arc::new(MemoryChatIndex::default()),
        }
    }

    pub async fn sqlite(dsn: &str) -> AppResult<Self> {
        ensure_sqlite_file(dsn).map_err(|err| {
            AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "database_init_failed", err)
        })?;

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                dsn.parse::<sqlx::sqlite::SqliteConnectOptions>()
                    .map_err(|err| {
                        AppError::new(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "database_dsn_parse_failed",
                            err.to_string(),
                        )
                    })?
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(5)),
            )
            .await
            .map_err(|err| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_init_failed",
                    err.to_string(),
                )
            })?;

        let kv = SqliteKvStore::new(pool.clone()).await.map_err(|err| {
            AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "kv_store_init_failed", err)
        })?;
        let blobs = SqliteBlobStore::new(pool.clone()).await.map_err(|err| {
            AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "blob_store_init_failed", err)
        })?;
        let index = SqliteChatIndex::new(pool).await.map_err(|err| {
            AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "chat_index_init_failed", err)
        })?;
        Ok(Self {
            kv: Arc::new(kv),
            blobs: Arc::new(blobs),
            index: Arc::new(index),
        })
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let stores = Stores::sqlite(&runtime.database_dsn).await?;
    build_state(runtime, stores)
}

pub fn build_state(runtime: RuntimeConfig, stores: Stores) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chatrouter/0.1")
        .connect_timeout(runtime.gateway.upstream_timeout())
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let metrics = init_metrics()?;
    let providers = Arc::new(ProviderSet::new(&runtime.gateway));

    tracing::info!(
        local = %runtime.gateway.local.base_url,
        hosted = %runtime.gateway.hosted.base_url,
        web = %runtime.gateway.web.base_url,
        upstream_timeout_ms = runtime.gateway.upstream_timeout_ms,
        stream_idle_timeout_ms = runtime.gateway.stream_idle_timeout_ms,
        "provider endpoints configured"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        providers,
        cache: CacheGate::new(stores.kv),
        transcripts: TranscriptPersister::new(stores.blobs, stores.index),
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn resolve_database_dsn() -> String {
    env_non_empty("CHATROUTER_DATABASE_DSN")
        .or_else(|| env_non_empty("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/chatrouter.db".to_string())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let root_api_router = build_root_api_router();
    Router::<AppState>::new()
        .merge(root_api_router.clone())
        .nest("/api", root_api_router)
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_root_api_router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(crate::handlers::create_chat))
        .route("/health", get(crate::handlers::health))
        .route("/models", get(crate::handlers::list_models))
        .route("/chats", get(crate::handlers::list_chats))
        .route("/chats/{chat_id}", get(crate::handlers::get_chat))
}
