use crate::config::ReceiverConfig;
use crate::metrics::Metrics;
use crate::report;
use crate::upload::FILE_FIELD;
use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, State};
use axum::http::{header::AUTHORIZATION, header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct ReceiverState {
    pub metrics: Arc<Metrics>,
    pub cfg: Arc<ReceiverConfig>,
}

#[derive(Debug, Serialize)]
struct UploadMeta {
    saved_as: String,
    original_name: String,
    size_bytes: u64,
    uploaded_at: String,
    uploader_ip: Option<String>,
    report_timestamp: Option<String>,
}

struct Rejection {
    status: StatusCode,
    reason: &'static str,
    message: String,
}

impl Rejection {
    fn new(status: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            message: message.into(),
        }
    }
}

pub fn build_router(metrics: Arc<Metrics>, cfg: ReceiverConfig) -> Router {
    let body_limit = usize::try_from(cfg.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/upload", post(upload_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(ReceiverState {
            metrics,
            cfg: Arc::new(cfg),
        })
}

pub async fn serve(
    cfg: ReceiverConfig,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr: SocketAddr = cfg
        .listen
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        listen = %addr,
        upload_dir = %cfg.upload_dir.display(),
        auth = cfg.token.is_some(),
        "приёмник отчётов запущен"
    );

    let app = build_router(metrics, cfg);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<ReceiverState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn upload_handler(
    State(state): State<ReceiverState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let peer_ip = peer.map(|ConnectInfo(addr)| addr.ip().to_string());
    match accept_upload(&state, &headers, multipart, peer_ip.clone()).await {
        Ok(saved_as) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "file": saved_as })),
        )
            .into_response(),
        Err(rejection) => {
            state.metrics.inc_rejected(rejection.reason);
            warn!(
                status = rejection.status.as_u16(),
                reason = rejection.reason,
                peer = ?peer_ip,
                "загрузка отклонена"
            );
            (
                rejection.status,
                Json(json!({ "error": rejection.message })),
            )
                .into_response()
        }
    }
}

async fn accept_upload(
    state: &ReceiverState,
    headers: &HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
    peer_ip: Option<String>,
) -> Result<String, Rejection> {
    check_token(headers, state.cfg.token.as_deref())?;
    let mut multipart =
        multipart.map_err(|err| multipart_rejection(err.status(), err.body_text()))?;

    let mut upload: Option<(String, Bytes)> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(multipart_rejection(err.status(), err.body_text())),
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let original = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|err| multipart_rejection(err.status(), err.body_text()))?;
        upload = Some((original, data));
        break;
    }

    let (original, data) = upload.ok_or_else(|| {
        Rejection::new(
            StatusCode::BAD_REQUEST,
            "missing_field",
            "No file uploaded (field \"file\" missing)",
        )
    })?;
    if data.len() as u64 > state.cfg.max_upload_bytes {
        return Err(Rejection::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "too_large",
            "File too large",
        ));
    }

    let original_name = base_name(&original).to_string();
    let saved_as = format!(
        "{}_{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        safe_upload_name(&original_name)
    );
    store(&state.cfg.upload_dir, &saved_as, &data).await?;

    let report_timestamp = std::str::from_utf8(&data)
        .ok()
        .and_then(|text| report::parse_structured(text).ok())
        .map(|snapshot| snapshot.timestamp);
    let meta = UploadMeta {
        saved_as: saved_as.clone(),
        original_name,
        size_bytes: data.len() as u64,
        uploaded_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
        uploader_ip: peer_ip,
        report_timestamp,
    };
    write_meta(&state.cfg.upload_dir, &meta).await;

    state.metrics.inc_stored(meta.size_bytes);
    info!(
        saved_as = %meta.saved_as,
        size_bytes = meta.size_bytes,
        peer = ?meta.uploader_ip,
        "отчёт принят"
    );
    Ok(saved_as)
}

fn check_token(headers: &HeaderMap, expected: Option<&str>) -> Result<(), Rejection> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Err(Rejection::new(
            StatusCode::UNAUTHORIZED,
            "auth_missing",
            "Authorization header missing",
        ));
    };
    let value = value.to_str().unwrap_or_default();
    let presented = value.strip_prefix("Bearer ").unwrap_or(value);
    if presented != expected {
        return Err(Rejection::new(
            StatusCode::FORBIDDEN,
            "auth_invalid",
            "Invalid token",
        ));
    }
    Ok(())
}

fn multipart_rejection(status: StatusCode, detail: String) -> Rejection {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return Rejection::new(status, "too_large", "File too large");
    }
    Rejection::new(
        status,
        "bad_multipart",
        format!("Upload error: {detail}"),
    )
}

async fn store(dir: &Path, saved_as: &str, data: &[u8]) -> Result<(), Rejection> {
    let failed = |err: std::io::Error| {
        error!(dir = %dir.display(), file = saved_as, error = %err, "не удалось сохранить загрузку");
        Rejection::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage",
            "Failed to move uploaded file",
        )
    };
    tokio::fs::create_dir_all(dir).await.map_err(failed)?;
    tokio::fs::write(dir.join(saved_as), data)
        .await
        .map_err(failed)
}

async fn write_meta(dir: &Path, meta: &UploadMeta) {
    let path = dir.join(format!("{}.meta.json", meta.saved_as));
    let result = match serde_json::to_vec_pretty(meta) {
        Ok(bytes) => tokio::fs::write(&path, bytes).await,
        Err(err) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
    };
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "метаданные загрузки не записаны");
    }
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn safe_upload_name(name: &str) -> String {
    if name.is_empty() {
        return "upload".to_string();
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
