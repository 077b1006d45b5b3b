use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Json, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json as ResponseJson,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::DetectConfig;
use crate::error::ErrorKind;
use crate::orchestrator::Detector;
use crate::response::DetectResponse;

/// 上传文件大小上限
pub const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

/// 调用方通过该请求头传入自己的 Gemini API key
pub const API_KEY_HEADER: &str = "x-api-key";

type Rejection = (StatusCode, ResponseJson<DetectResponse>);
type HandlerResult = Result<ResponseJson<DetectResponse>, Rejection>;

/// 服务共享状态
///
/// 只有配置和连接池，API key 按请求传入。
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DetectConfig>,
    pub http: reqwest::Client,
    /// 请求未携带 key 时使用的服务端 key
    pub default_api_key: Option<String>,
}

impl AppState {
    pub fn new(config: DetectConfig, default_api_key: Option<String>) -> Self {
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
            default_api_key,
        }
    }

    fn detector(
        &self,
        api_key: Option<String>,
        max_frames: Option<usize>,
    ) -> Result<Detector, Rejection> {
        let api_key = api_key
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.default_api_key.clone())
            .ok_or_else(|| {
                reject(
                    StatusCode::UNAUTHORIZED,
                    ErrorKind::AnalysisServiceError,
                    format!("缺少 API key（请求头 {}）", API_KEY_HEADER),
                )
            })?;

        let mut config = self.config.as_ref().clone();
        if let Some(max_frames) = max_frames {
            if max_frames == 0 {
                return Err(reject(
                    StatusCode::BAD_REQUEST,
                    ErrorKind::Internal,
                    "max_frames 必须大于 0",
                ));
            }
            config.max_frames_per_video = max_frames;
        }

        Detector::with_gemini(self.http.clone(), api_key, config)
            .map_err(|e| reject(StatusCode::UNAUTHORIZED, e.kind(), e.to_string()))
    }
}

/// 创建 HTTP 路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        // 上传文件检测：请求体为文件内容
        .route("/detect", post(handle_detect))
        // 检测服务器本地文件
        .route("/detect/direct", post(handle_direct_detect))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .with_state(state)
}

/// 健康检查 Handler
pub async fn health_check() -> &'static str {
    "OK"
}

/// 错误类别对应的 HTTP 状态码
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::CorruptMedia | ErrorKind::EmptyVideo => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::AnalysisTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::AnalysisServiceError | ErrorKind::AggregationError => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Rejection {
    (status, ResponseJson(DetectResponse::failure(kind, message)))
}

fn respond(response: DetectResponse) -> HandlerResult {
    match response.error_kind {
        None => Ok(ResponseJson(response)),
        Some(kind) => Err((status_for(kind), ResponseJson(response))),
    }
}

/// 上传检测的查询参数
#[derive(Debug, Deserialize)]
pub struct DetectQuery {
    /// 文件名或 MIME 类型，用于判断媒体类别
    pub file_name: String,
    /// 覆盖每个视频的最大采样帧数
    pub max_frames: Option<usize>,
}

/// 上传检测 Handler
pub async fn handle_detect(
    State(state): State<AppState>,
    Query(query): Query<DetectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    info!("收到检测请求: {} ({} 字节)", query.file_name, body.len());

    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let detector = state.detector(api_key, query.max_frames)?;

    let request = detector.detect(body.to_vec(), &query.file_name).await;
    respond(DetectResponse::from_request(&request, Some(query.file_name.as_str())))
}

/// 把请求中的路径限制在 `root` 之内
///
/// 带 `..` 的路径、根目录以外的绝对路径和指向根目录以外的符号链接都拒绝（403），
/// 根目录内不存在的文件返回 404。
fn resolve_direct_path(root: &Path, input: &str) -> Result<PathBuf, Rejection> {
    let forbidden = || {
        reject(
            StatusCode::FORBIDDEN,
            ErrorKind::UnsupportedFormat,
            "路径不在允许的目录内",
        )
    };

    let root = root.canonicalize().map_err(|e| {
        warn!("direct_root 不可用: {} - {}", root.display(), e);
        reject(
            StatusCode::FORBIDDEN,
            ErrorKind::Internal,
            "direct_root 不可用",
        )
    })?;

    let requested = Path::new(input);
    if requested
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(forbidden());
    }
    let candidate = if requested.is_absolute() {
        if !requested.starts_with(&root) {
            return Err(forbidden());
        }
        requested.to_path_buf()
    } else {
        root.join(requested)
    };

    let resolved = candidate.canonicalize().map_err(|_| {
        reject(
            StatusCode::NOT_FOUND,
            ErrorKind::CorruptMedia,
            format!("文件不存在: {}", input),
        )
    })?;
    if !resolved.starts_with(&root) {
        return Err(forbidden());
    }
    if !resolved.is_file() {
        return Err(reject(
            StatusCode::NOT_FOUND,
            ErrorKind::CorruptMedia,
            format!("文件不存在: {}", input),
        ));
    }
    Ok(resolved)
}

/// 直接检测请求（服务器本地文件）
#[derive(Debug, Deserialize)]
pub struct DirectDetectRequest {
    /// 文件路径，相对路径按 direct_root 解析
    pub input: String,
    /// Gemini API key（可选，未提供时使用服务端配置）
    pub api_key: Option<String>,
    /// 覆盖每个视频的最大采样帧数
    pub max_frames: Option<usize>,
}

/// 直接检测 Handler
pub async fn handle_direct_detect(
    State(state): State<AppState>,
    Json(request): Json<DirectDetectRequest>,
) -> HandlerResult {
    info!("收到直接检测请求: {}", request.input);

    let Some(root) = state.config.direct_root.as_deref() else {
        return Err(reject(
            StatusCode::FORBIDDEN,
            ErrorKind::UnsupportedFormat,
            "未配置 direct_root，直接检测接口已关闭",
        ));
    };
    let input_path = resolve_direct_path(root, &request.input).map_err(|rejection| {
        warn!("拒绝直接检测请求: {}", request.input);
        rejection
    })?;

    let detector = state.detector(request.api_key, request.max_frames)?;
    let detection = detector.detect_path(&input_path).await;
    respond(DetectResponse::from_request(&detection, Some(request.input.as_str())))
}
