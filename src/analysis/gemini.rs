//! Google Gemini 分类器实现

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{build_prompt, parse_verdict, Classifier, UnitVerdict};
use crate::error::DetectError;
use crate::media::MediaUnit;

/// 发送给模型的 JPEG 质量
const JPEG_QUALITY: u8 = 90;

/// 基于 Gemini `generateContent` 接口的分类器
pub struct GeminiClassifier {
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl GeminiClassifier {
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";
    pub const DEFAULT_MODEL: &'static str = "gemini-1.5-flash";

    /// 创建分类器
    ///
    /// `client` 可以在多个分类器之间共享（连接池复用），凭证随实例走，不依赖全局状态。
    pub fn new(
        client: reqwest::Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DetectError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(DetectError::service_fatal("Gemini API key 不能为空"));
        }

        Ok(Self {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn build_request(&self, unit: &MediaUnit) -> Result<GenerateContentRequest, DetectError> {
        let jpeg = unit.to_jpeg(JPEG_QUALITY)?;

        Ok(GenerateContentRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![
                    Part::text(build_prompt(unit)),
                    Part::inline("image/jpeg", STANDARD.encode(jpeg)),
                ],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                response_mime_type: "application/json".to_string(),
            },
        })
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn analyze_unit(&self, unit: &MediaUnit) -> Result<UnitVerdict, DetectError> {
        let body = self.build_request(unit)?;

        // API key 走请求头，避免出现在日志里的 URL 中
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let text = extract_text(&text)?;
        debug!("单元 {} 模型响应 {} 字节", unit.index, text.len());
        parse_verdict(unit.index, &text)
    }
}

impl GeminiClassifier {
    fn transport_error(&self, e: reqwest::Error) -> DetectError {
        if e.is_timeout() {
            DetectError::AnalysisTimeout(self.timeout)
        } else {
            DetectError::service(format!("请求 Gemini 失败: {}", e))
        }
    }
}

/// 408/429/5xx 可以重试，其余 4xx（鉴权、参数错误）重试也不会成功
fn status_error(status: StatusCode, body: &str) -> DetectError {
    let message = serde_json::from_str::<ApiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(200).collect());
    let message = format!("Gemini API 错误 ({}): {}", status, message);

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        DetectError::service(message)
    } else {
        DetectError::service_fatal(message)
    }
}

/// 从响应体中取出模型输出的文本
fn extract_text(body: &str) -> Result<String, DetectError> {
    let response: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|e| DetectError::service(format!("Gemini 响应格式错误: {}", e)))?;

    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(DetectError::service_fatal(format!(
            "请求被 Gemini 安全策略拦截: {}",
            reason
        )));
    }

    let candidate = response
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| DetectError::service("Gemini 未返回候选结果"))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
        return if reason == "SAFETY" {
            Err(DetectError::service_fatal("输出被 Gemini 安全策略拦截"))
        } else {
            Err(DetectError::service(format!("Gemini 返回空内容 (finishReason={})", reason)))
        };
    }

    Ok(text)
}

// =============================================================================
// Gemini API 数据结构
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            inline_data: None,
        }
    }

    fn inline(mime_type: &str, data: String) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use image::{DynamicImage, RgbImage};
    use serde_json::{json, Value};

    fn unit() -> MediaUnit {
        MediaUnit::still(DynamicImage::ImageRgb8(RgbImage::new(4, 4)))
    }

    fn classifier(base_url: &str, timeout: Duration) -> GeminiClassifier {
        GeminiClassifier::new(
            reqwest::Client::new(),
            "test-key",
            base_url,
            GeminiClassifier::DEFAULT_MODEL,
            timeout,
        )
        .unwrap()
    }

    /// 在本地端口上启动一个假的 Gemini 服务
    pub(crate) async fn mock_gemini(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1beta", addr)
    }

    pub(crate) fn candidate(text: &str) -> Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] }, "finishReason": "STOP" }] })
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let result = GeminiClassifier::new(
            reqwest::Client::new(),
            "  ",
            GeminiClassifier::DEFAULT_BASE_URL,
            GeminiClassifier::DEFAULT_MODEL,
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(DetectError::AnalysisService { retryable: false, .. })));
    }

    #[test]
    fn test_request_shape() {
        let gemini = classifier("https://example.test/v1beta/", Duration::from_secs(5));
        assert_eq!(
            gemini.endpoint(),
            "https://example.test/v1beta/models/gemini-1.5-flash:generateContent"
        );

        let body = serde_json::to_value(gemini.build_request(&unit()).unwrap()).unwrap();
        let parts = &body["contents"][0]["parts"];
        assert!(parts[0]["text"].as_str().unwrap().contains("is_deepfake"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert!(!parts[1]["inlineData"]["data"].as_str().unwrap().is_empty());
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "quota").is_retryable());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(!status_error(StatusCode::UNAUTHORIZED, "").is_retryable());

        let err = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"error": {"code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT"}}"#,
        );
        assert!(err.to_string().contains("API key not valid"));
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let body = json!({ "candidates": [{ "content": { "parts": [{ "text": "{\"is_deepfake\":" }, { "text": " false}" }] } }] });
        assert_eq!(extract_text(&body.to_string()).unwrap(), "{\"is_deepfake\": false}");
    }

    #[test]
    fn test_blocked_prompt_is_not_retryable() {
        let body = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let err = extract_text(&body.to_string()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_empty_candidate_is_retryable() {
        let body = json!({ "candidates": [{ "finishReason": "MAX_TOKENS" }] });
        assert!(extract_text(&body.to_string()).unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_round_trip_against_mock_service() {
        let router = Router::new().route(
            "/v1beta/models/:model",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-goog-api-key"], "test-key");
                assert!(body["contents"][0]["parts"][1]["inlineData"]["data"].is_string());
                Json(candidate(
                    r#"{"is_deepfake": true, "confidence_score": 91, "analysis": "seam", "indicators": ["seam"]}"#,
                ))
            }),
        );
        let base_url = mock_gemini(router).await;

        let verdict = classifier(&base_url, Duration::from_secs(5))
            .analyze_unit(&unit())
            .await
            .unwrap();
        assert!(verdict.is_deepfake);
        assert_eq!(verdict.confidence_score, 91.0);
        assert_eq!(verdict.indicators, vec!["seam"]);
    }

    #[tokio::test]
    async fn test_slow_service_maps_to_timeout() {
        let router = Router::new().route(
            "/v1beta/models/:model",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(candidate("{}"))
            }),
        );
        let base_url = mock_gemini(router).await;

        let err = classifier(&base_url, Duration::from_millis(100))
            .analyze_unit(&unit())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::AnalysisTimeout(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let router = Router::new().route(
            "/v1beta/models/:model",
            post(|| async {
                (
                    axum::http::StatusCode::FORBIDDEN,
                    Json(json!({ "error": { "message": "permission denied" } })),
                )
            }),
        );
        let base_url = mock_gemini(router).await;

        let err = classifier(&base_url, Duration::from_secs(5))
            .analyze_unit(&unit())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::AnalysisService { retryable: false, .. }));
    }
}
