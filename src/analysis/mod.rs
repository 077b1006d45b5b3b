//! 分析客户端
//!
//! 把单个分析单元交给外部分类器，并把响应规范化为 [`UnitVerdict`]。
//! 这里只做一次请求到结果的映射，重试由编排器负责。

pub mod gemini;
pub mod parse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DetectError;
use crate::media::MediaUnit;

pub use gemini::GeminiClassifier;
pub use parse::parse_verdict;

/// 单个分析单元的规范化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitVerdict {
    /// 对应 MediaUnit 的 index
    pub index: usize,
    pub is_deepfake: bool,
    /// 0-100
    pub confidence_score: f64,
    /// 检测到的伪造迹象（保持模型给出的顺序）
    pub indicators: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suspicious_areas: Vec<String>,
    pub raw_explanation: String,
}

impl UnitVerdict {
    /// 伪造风险 0-100：confidence_score 是对本次判断的把握，非伪造时取反
    pub fn manipulation_risk(&self) -> f64 {
        if self.is_deepfake {
            self.confidence_score
        } else {
            100.0 - self.confidence_score
        }
    }
}

/// 可替换的分类器接口：提交媒体，得到判断
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// 分析一个单元。失败返回 `AnalysisTimeout` 或 `AnalysisService`
    async fn analyze_unit(&self, unit: &MediaUnit) -> Result<UnitVerdict, DetectError>;
}

/// 固定的评估指令
pub const EVALUATION_PROMPT: &str = r#"Analyze this image for signs of being a deepfake or AI-generated content.

Examine the following aspects:
1. Facial features: irregularities in eyes, teeth, skin texture, facial symmetry
2. Lighting and shadows: inconsistent lighting, unnatural shadows, mismatched light sources
3. Artifacts: compression artifacts, blending errors, warping, unnatural edges
4. Background: blurry or inconsistent backgrounds, unrealistic elements
5. Details: hair texture, jewelry, reflections and other fine details that generators struggle with
6. Context: overall scene coherence and realism

Respond with a single JSON object and nothing else:
{
    "is_deepfake": true or false,
    "confidence_score": number from 0 to 100, how confident you are in the is_deepfake verdict,
    "analysis": "detailed explanation of your findings",
    "indicators": ["specific indicators found"],
    "suspicious_areas": ["areas that seem manipulated or artificial"]
}"#;

/// 生成发送给模型的完整指令；视频帧附带帧位置
pub fn build_prompt(unit: &MediaUnit) -> String {
    match unit.timestamp {
        Some(ts) => format!(
            "This is frame #{} (at {:.2}s) sampled from a video.\n\n{}",
            unit.index, ts, EVALUATION_PROMPT
        ),
        None => EVALUATION_PROMPT.to_string(),
    }
}
