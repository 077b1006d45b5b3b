use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 检测流程中的错误分类
///
/// - 输入校验类（`UnsupportedFormat` / `CorruptMedia` / `EmptyVideo`）不可重试，原样返回给调用方
/// - 分析类（`AnalysisTimeout` / `AnalysisService`）按单元重试，耗尽后计入 `failure_count`
/// - `Aggregation` 表示所有单元都失败，没有可汇总的结果
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("不支持的媒体格式: {0}")]
    UnsupportedFormat(String),

    #[error("媒体文件无法解码: {0}")]
    CorruptMedia(String),

    #[error("视频中没有可解码的帧")]
    EmptyVideo,

    #[error("分析服务超时（{:.1}秒）", .0.as_secs_f64())]
    AnalysisTimeout(Duration),

    #[error("分析服务错误: {message}")]
    AnalysisService { message: String, retryable: bool },

    #[error("结果汇总失败: {0}")]
    Aggregation(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl DetectError {
    /// 可重试的分析服务错误
    pub fn service(message: impl Into<String>) -> Self {
        Self::AnalysisService {
            message: message.into(),
            retryable: true,
        }
    }

    /// 不可重试的分析服务错误（鉴权失败、请求被拒绝等）
    pub fn service_fatal(message: impl Into<String>) -> Self {
        Self::AnalysisService {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::CorruptMedia(_) => ErrorKind::CorruptMedia,
            Self::EmptyVideo => ErrorKind::EmptyVideo,
            Self::AnalysisTimeout(_) => ErrorKind::AnalysisTimeout,
            Self::AnalysisService { .. } => ErrorKind::AnalysisServiceError,
            Self::Aggregation(_) => ErrorKind::AggregationError,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 编排器是否应该对该错误重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AnalysisTimeout(_) => true,
            Self::AnalysisService { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// 可序列化的错误类别，用于 `Failed` 状态和 HTTP 响应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    CorruptMedia,
    EmptyVideo,
    AnalysisTimeout,
    AnalysisServiceError,
    AggregationError,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DetectError::AnalysisTimeout(Duration::from_secs(5)).is_retryable());
        assert!(DetectError::service("503").is_retryable());
        assert!(!DetectError::service_fatal("401").is_retryable());
        assert!(!DetectError::EmptyVideo.is_retryable());
        assert!(!DetectError::UnsupportedFormat("txt".into()).is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let kind = DetectError::service("x").kind();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"analysis_service_error\"");
    }
}
