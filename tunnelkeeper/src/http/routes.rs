use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::{Body, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::error;

use utils::http::endpoint::{self, request_span};
use utils::http::error::ApiError;
use utils::http::json::{json_request, json_response};
use utils::http::request::{ensure_no_body, parse_query_param, parse_request_param};
use utils::http::{RequestExt, RouterBuilder};
use utils::id::TunnelId;

use crate::library::LibraryError;
use crate::monitor::{Monitor, TickSummary};
use crate::store::{StateStore, StoreError};
use crate::token::{TokenError, TokenService};
use crate::tunnel::{
    requests_key, CreateTunnelError, DestroyOutcome, HistoryEntry, TunnelManager, TunnelRecord,
};
use crate::TunnelKeeperConf;

/// Everything the handlers need, attached to the router as shared data.
pub struct AppState {
    pub conf: Arc<TunnelKeeperConf>,
    pub store: Arc<dyn StateStore>,
    pub manager: Arc<TunnelManager>,
    pub tokens: Arc<TokenService>,
    pub monitor: Arc<Monitor>,
    pub started_at: Instant,
}

fn get_state(request: &Request<Body>) -> &Arc<AppState> {
    request.data::<Arc<AppState>>().expect("unknown state type")
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => ApiError::ResourceUnavailable(msg.into()),
            StoreError::Other(msg) => ApiError::InternalServerError(anyhow::anyhow!(msg)),
        }
    }
}

fn create_error_to_api(e: CreateTunnelError) -> ApiError {
    match e {
        CreateTunnelError::Library(LibraryError::NotFound(path)) => {
            ApiError::NotFound(anyhow::anyhow!("file not found: {path}"))
        }
        CreateTunnelError::Library(err) => ApiError::BadRequest(err.into()),
        CreateTunnelError::Store(err) => err.into(),
        CreateTunnelError::ShuttingDown => ApiError::ShuttingDown,
        err @ (CreateTunnelError::IdAllocation
        | CreateTunnelError::Staging(_)
        | CreateTunnelError::EdgeProvision(_)) => ApiError::InternalServerError(err.into()),
    }
}

#[derive(Debug, Deserialize)]
struct GenerateLinkRequest {
    file_path: String,
    expires_in_seconds: u64,
}

#[derive(Debug, Serialize)]
struct GenerateLinkResponse {
    download_url: String,
    tunnel_id: TunnelId,
    token: String,
    file_path: String,
    expires_in_seconds: u64,
}

/// `POST /generate-link`: stage + publish a file and mint the single-use
/// token for it. The requested TTL must be positive; values outside
/// `[60, max_tunnel_lifetime]` are clamped.
async fn generate_link_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let request_data: GenerateLinkRequest = json_request(&mut request).await?;
    let state = get_state(&request);

    if request_data.expires_in_seconds == 0 {
        return Err(ApiError::BadRequest(anyhow::anyhow!(
            "expires_in_seconds must be positive"
        )));
    }
    let ttl = state
        .tokens
        .clamp_ttl(Duration::from_secs(request_data.expires_in_seconds));

    let record = state
        .manager
        .create_tunnel(&request_data.file_path, ttl)
        .await
        .map_err(create_error_to_api)?;

    let token = match state
        .tokens
        .mint(&record.file_path, ttl, record.tunnel_id)
        .await
    {
        Ok(token) => token,
        Err(e) => {
            // Without a token the tunnel is unreachable; take it down again.
            if let Err(destroy_err) = state
                .manager
                .destroy_tunnel(record.tunnel_id, crate::tunnel::DestroyReason::Failed)
                .await
            {
                error!(
                    "cleanup after failed mint for tunnel {} failed: {destroy_err:#}",
                    record.tunnel_id
                );
            }
            return Err(match e {
                TokenError::Store(err) => err.into(),
                TokenError::Invalid => {
                    ApiError::InternalServerError(anyhow::anyhow!("could not sign token"))
                }
            });
        }
    };

    let download_url = record.download_url().ok_or_else(|| {
        ApiError::InternalServerError(anyhow::anyhow!("active tunnel has no public url"))
    })?;

    json_response(
        StatusCode::OK,
        GenerateLinkResponse {
            download_url,
            tunnel_id: record.tunnel_id,
            token,
            file_path: record.file_path,
            expires_in_seconds: ttl.as_secs(),
        },
    )
}

/// `GET /api/files`: relative paths of everything shareable, sorted.
async fn files_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let files = state
        .manager
        .library()
        .list_files()
        .await
        .map_err(ApiError::InternalServerError)?;
    json_response(StatusCode::OK, files)
}

#[derive(Debug, Serialize)]
struct ActiveTunnelsResponse {
    active_tunnels: Vec<TunnelRecord>,
}

async fn admin_tunnels_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let active_tunnels = state.manager.list_active().await?;
    json_response(StatusCode::OK, ActiveTunnelsResponse { active_tunnels })
}

#[derive(Debug, Serialize)]
struct TunnelStatsResponse {
    #[serde(flatten)]
    record: TunnelRecord,
    progress_percent: f64,
    remaining_seconds: i64,
    /// Distinct request ids the access log has attributed to this tunnel.
    requests_seen: u64,
}

async fn tunnel_stats_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let tunnel_id: TunnelId = parse_request_param(&request, "tunnel_id")?;
    let state = get_state(&request);

    let record = state
        .manager
        .get(tunnel_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(anyhow::anyhow!("unknown tunnel {tunnel_id}")))?;

    let progress_percent = if record.file_size == 0 {
        if record.last_activity_at.is_some() { 100.0 } else { 0.0 }
    } else {
        (record.bytes_served.min(record.file_size) as f64 / record.file_size as f64) * 100.0
    };
    let remaining_seconds = (record.expires_at - chrono::Utc::now()).num_seconds().max(0);
    let requests_seen = state.store.set_len(&requests_key(tunnel_id)).await?;

    json_response(
        StatusCode::OK,
        TunnelStatsResponse {
            record,
            progress_percent,
            remaining_seconds,
            requests_seen,
        },
    )
}

async fn tunnel_delete_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let tunnel_id: TunnelId = parse_request_param(&request, "tunnel_id")?;
    ensure_no_body(&mut request).await?;
    let state = get_state(&request);

    match state
        .manager
        .terminate(tunnel_id)
        .await
        .map_err(ApiError::InternalServerError)?
    {
        DestroyOutcome::AlreadyDestroyed => Err(ApiError::NotFound(anyhow::anyhow!(
            "unknown tunnel {tunnel_id}"
        ))),
        DestroyOutcome::Destroyed | DestroyOutcome::InProgress => json_response(
            StatusCode::OK,
            serde_json::json!({ "tunnel_id": tunnel_id, "status": "terminated" }),
        ),
    }
}

#[derive(Debug, Serialize)]
struct MonitorStatusResponse {
    active_tunnels_count: usize,
    active_downloads: u64,
    state_store_connected: bool,
    state_store_memory: Option<String>,
    /// Seconds since process start.
    uptime: u64,
    monitor_active: bool,
    log_parse_errors: u64,
}

async fn monitor_status_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);

    let state_store_connected = state.store.ping().await.is_ok();
    let state_store_memory = if state_store_connected {
        state.store.memory_usage().await.unwrap_or(None)
    } else {
        None
    };
    let active_tunnels_count = if state_store_connected {
        state.manager.list_active().await?.len()
    } else {
        0
    };

    json_response(
        StatusCode::OK,
        MonitorStatusResponse {
            active_tunnels_count,
            active_downloads: state.monitor.active_downloads(),
            state_store_connected,
            state_store_memory,
            uptime: state.started_at.elapsed().as_secs(),
            monitor_active: state.monitor.is_active(),
            log_parse_errors: state.monitor.parse_errors(),
        },
    )
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    ticked: TickSummary,
    swept_tokens: u64,
}

async fn cleanup_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    ensure_no_body(&mut request).await?;
    let state = get_state(&request);
    let (ticked, swept_tokens) = state
        .monitor
        .force_cleanup()
        .await
        .map_err(ApiError::InternalServerError)?;
    json_response(
        StatusCode::OK,
        CleanupResponse {
            ticked,
            swept_tokens,
        },
    )
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    history: Vec<HistoryEntry>,
}

async fn history_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    let limit: usize = parse_query_param(&request, "limit")?
        .unwrap_or(100)
        .min(state.conf.history_limit);
    let history = state.manager.history(limit).await?;
    json_response(StatusCode::OK, HistoryResponse { history })
}

async fn health_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let state = get_state(&request);
    state.store.ping().await?;
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    public_url: String,
}

/// `GET /download/{token}`: consume the token and hand back the public URL.
/// Any invalid token, and any token whose tunnel is gone, gets the
/// connection dropped without an explanation.
async fn download_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let token: String = parse_request_param(&request, "token")?;
    let state = get_state(&request);

    let claims = match state.tokens.validate_and_consume(&token).await {
        Ok(claims) => claims,
        Err(TokenError::Invalid) => return Err(ApiError::ConnectionDrop),
        Err(TokenError::Store(e)) => return Err(e.into()),
    };

    let public_url = state
        .manager
        .get(claims.tunnel_id)
        .await?
        .and_then(|record| record.download_url())
        .ok_or(ApiError::ConnectionDrop)?;

    json_response(StatusCode::OK, DownloadResponse { public_url })
}

async fn metrics_handler(_request: Request<Body>) -> Result<Response<Body>, ApiError> {
    use prometheus::Encoder;
    let metrics = prometheus::gather();
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metrics, &mut buffer)
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| ApiError::InternalServerError(e.into()))
}

/// Control-plane router.
pub fn make_router(state: Arc<AppState>) -> RouterBuilder<hyper::Body, ApiError> {
    endpoint::make_router()
        .data(state)
        .post("/generate-link", |r| {
            request_span(r, generate_link_handler)
        })
        .get("/api/files", |r| request_span(r, files_handler))
        .get("/admin/tunnels", |r| request_span(r, admin_tunnels_handler))
        .get("/admin/tunnels/:tunnel_id/stats", |r| {
            request_span(r, tunnel_stats_handler)
        })
        .delete("/admin/tunnels/:tunnel_id", |r| {
            request_span(r, tunnel_delete_handler)
        })
        .get("/admin/monitor/status", |r| {
            request_span(r, monitor_status_handler)
        })
        .post("/admin/cleanup", |r| request_span(r, cleanup_handler))
        .get("/admin/history", |r| request_span(r, history_handler))
        .get("/health", |r| request_span(r, health_handler))
        .get("/download/:token", |r| request_span(r, download_handler))
        .get("/metrics", |r| request_span(r, metrics_handler))
}
