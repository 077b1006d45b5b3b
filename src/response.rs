use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::aggregator::AggregateReport;
use crate::error::ErrorKind;
use crate::media::{MediaInfo, MediaKind};
use crate::orchestrator::{DetectionRequest, RequestState, Stage};

/// 检测请求的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResponse {
    /// 是否成功
    pub success: bool,

    /// 消息
    pub message: String,

    /// 失败时的错误类别
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// 检测结果
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DetectResult>,
}

/// 检测结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResult {
    pub request_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,

    pub report: AggregateReport,

    /// 请求经历的阶段
    pub stages: Vec<Stage>,

    pub elapsed_ms: u64,

    pub analyzed_at: DateTime<Utc>,
}

impl DetectResponse {
    pub fn from_request(request: &DetectionRequest, file_name: Option<&str>) -> Self {
        match request.state() {
            RequestState::Done { report } => Self {
                success: true,
                message: headline(report),
                error_kind: None,
                result: Some(DetectResult {
                    request_id: request.id.to_string(),
                    file_name: file_name.map(str::to_string),
                    media: request.media.clone(),
                    report: report.clone(),
                    stages: request.history().to_vec(),
                    elapsed_ms: request.elapsed().as_millis() as u64,
                    analyzed_at: Utc::now(),
                }),
            },
            RequestState::Failed { kind, message } => Self::failure(*kind, message.clone()),
            other => Self::failure(
                ErrorKind::Internal,
                format!("请求未结束: {:?}", other.stage()),
            ),
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_kind: Some(kind),
            result: None,
        }
    }
}

fn headline(report: &AggregateReport) -> String {
    let verdict = if report.overall_is_deepfake {
        "疑似深度伪造"
    } else {
        "未发现明显伪造迹象"
    };
    match report.media_kind {
        MediaKind::Image => format!(
            "检测完成: {}（置信度 {:.1}）",
            verdict, report.overall_confidence_score
        ),
        MediaKind::Video => format!(
            "检测完成: {}（置信度 {:.1}，可疑帧 {}/{}）",
            verdict,
            report.overall_confidence_score,
            report.suspicious_unit_count,
            report.unit_verdicts.len()
        ),
    }
}

/// 生成便于阅读的文本报告
pub fn render_summary(report: &AggregateReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", headline(report));

    if let Some(note) = &report.verdict_note {
        let _ = writeln!(out, "  • 说明: {}", note);
    }
    if let Some(note) = &report.temporal_consistency_note {
        match report.confidence_variance {
            Some(variance) => {
                let _ = writeln!(out, "  • 时间一致性: {}（方差 {:.1}）", note, variance);
            }
            None => {
                let _ = writeln!(out, "  • 时间一致性: {}", note);
            }
        }
    }
    if report.failure_count > 0 {
        let _ = writeln!(out, "  • 未能分析的单元: {} 个", report.failure_count);
    }
    if !report.indicators.is_empty() {
        let _ = writeln!(out, "  • 伪造迹象:");
        for indicator in &report.indicators {
            let _ = writeln!(out, "      - {}", indicator);
        }
    }

    if report.media_kind == MediaKind::Video {
        let _ = writeln!(out, "  • 逐帧结果:");
        for verdict in &report.unit_verdicts {
            let _ = writeln!(
                out,
                "      帧 #{:<6} {} {:>5.1}",
                verdict.index,
                if verdict.is_deepfake { "可疑" } else { "正常" },
                verdict.confidence_score
            );
        }
    } else if let Some(verdict) = report.unit_verdicts.first() {
        if !verdict.raw_explanation.is_empty() {
            let _ = writeln!(out, "  • 分析: {}", verdict.raw_explanation);
        }
    }

    out
}
