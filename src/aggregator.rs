use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::UnitVerdict;
use crate::error::DetectError;
use crate::media::MediaKind;

/// 汇总策略参数
///
/// 多数阈值和方差阈值都是可调的策略常量，默认值没有经过严格标定。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatePolicy {
    /// 判为伪造所需的可疑帧比例（严格大于）
    pub majority_threshold: f64,
    /// 方差不高于此值视为各帧一致
    pub low_variance: f64,
    /// 方差不低于此值视为各帧不一致
    pub high_variance: f64,
    /// 一致且平均伪造风险低于此值视为低风险
    pub low_risk_mean: f64,
}

impl Default for AggregatePolicy {
    fn default() -> Self {
        Self {
            majority_threshold: 0.5,
            low_variance: 100.0,
            high_variance: 400.0,
            low_risk_mean: 50.0,
        }
    }
}

/// 各帧分数的时间一致性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalConsistency {
    ConsistentLowRisk,
    ConsistentElevatedRisk,
    Moderate,
    Inconsistent,
}

impl TemporalConsistency {
    pub fn note(&self) -> &'static str {
        match self {
            Self::ConsistentLowRisk => "consistent, low risk",
            Self::ConsistentElevatedRisk => "consistent, elevated risk",
            Self::Moderate => "moderately consistent",
            Self::Inconsistent => "inconsistent across frames, possible localized manipulation",
        }
    }
}

/// 一次检测请求的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub media_kind: MediaKind,
    pub overall_is_deepfake: bool,
    /// 0-100，由 unit_verdicts 确定性计算
    pub overall_confidence_score: f64,
    /// 采样顺序，不按分数重排
    pub unit_verdicts: Vec<UnitVerdict>,
    pub suspicious_unit_count: usize,
    /// 所有单元指标的并集，按首次出现顺序
    pub indicators: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_consistency: Option<TemporalConsistency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_consistency_note: Option<String>,
    /// 各帧伪造风险的总体方差
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_variance: Option<f64>,
    /// 可疑比例未超过阈值时的说明
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict_note: Option<String>,
    /// 未能完成分析的单元数
    pub failure_count: usize,
}

/// 将多个单元判断合并为一份报告
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    policy: AggregatePolicy,
}

impl Aggregator {
    pub fn new(policy: AggregatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AggregatePolicy {
        &self.policy
    }

    /// 汇总单元判断
    ///
    /// 没有任何成功的单元时返回 `Aggregation` 错误，不会生成零分报告。
    pub fn aggregate(
        &self,
        kind: MediaKind,
        verdicts: Vec<UnitVerdict>,
        failure_count: usize,
    ) -> Result<AggregateReport, DetectError> {
        if verdicts.is_empty() {
            return Err(DetectError::Aggregation(format!(
                "全部 {} 个单元分析失败，没有可汇总的结果",
                failure_count
            )));
        }

        let report = match (kind, verdicts.len()) {
            (MediaKind::Image, 1) => Self::single(verdicts, failure_count),
            _ => self.multi(kind, verdicts, failure_count),
        };

        debug!(
            "汇总完成: 伪造={}，置信度 {:.1}，可疑 {}/{}，失败 {}",
            report.overall_is_deepfake,
            report.overall_confidence_score,
            report.suspicious_unit_count,
            report.unit_verdicts.len(),
            report.failure_count
        );

        Ok(report)
    }

    fn single(verdicts: Vec<UnitVerdict>, failure_count: usize) -> AggregateReport {
        let verdict = &verdicts[0];
        AggregateReport {
            media_kind: MediaKind::Image,
            overall_is_deepfake: verdict.is_deepfake,
            overall_confidence_score: verdict.confidence_score,
            suspicious_unit_count: usize::from(verdict.is_deepfake),
            indicators: verdict.indicators.clone(),
            temporal_consistency: None,
            temporal_consistency_note: None,
            confidence_variance: None,
            verdict_note: None,
            failure_count,
            unit_verdicts: verdicts,
        }
    }

    fn multi(
        &self,
        kind: MediaKind,
        verdicts: Vec<UnitVerdict>,
        failure_count: usize,
    ) -> AggregateReport {
        let analyzed = verdicts.len();
        let mean_score =
            verdicts.iter().map(|v| v.confidence_score).sum::<f64>() / analyzed as f64;

        // 置信度是对各自判断的把握，一致性按统一方向的伪造风险计算
        let risks: Vec<f64> = verdicts.iter().map(UnitVerdict::manipulation_risk).collect();
        let mean_risk = risks.iter().sum::<f64>() / analyzed as f64;
        let variance = risks.iter().map(|r| (r - mean_risk).powi(2)).sum::<f64>() / analyzed as f64;

        let suspicious = verdicts.iter().filter(|v| v.is_deepfake).count();
        let fraction = suspicious as f64 / analyzed as f64;
        let overall_is_deepfake = fraction > self.policy.majority_threshold;

        // 有可疑帧但未超过阈值：判为非伪造，并显式标注证据不足
        let verdict_note = (!overall_is_deepfake && suspicious > 0).then(|| {
            format!(
                "evidence inconclusive: {}/{} units flagged, not above the {:.0}% majority threshold",
                suspicious,
                analyzed,
                self.policy.majority_threshold * 100.0
            )
        });

        let temporal = (kind == MediaKind::Video).then(|| self.classify_temporal(mean_risk, variance));

        AggregateReport {
            media_kind: kind,
            overall_is_deepfake,
            overall_confidence_score: mean_score,
            suspicious_unit_count: suspicious,
            indicators: merge_indicators(&verdicts),
            temporal_consistency: temporal,
            temporal_consistency_note: temporal.map(|t| t.note().to_string()),
            confidence_variance: temporal.map(|_| variance),
            verdict_note,
            failure_count,
            unit_verdicts: verdicts,
        }
    }

    /// 按伪造风险的均值和方差划分一致性
    pub fn classify_temporal(&self, mean_risk: f64, variance: f64) -> TemporalConsistency {
        if variance >= self.policy.high_variance {
            TemporalConsistency::Inconsistent
        } else if variance <= self.policy.low_variance {
            if mean_risk < self.policy.low_risk_mean {
                TemporalConsistency::ConsistentLowRisk
            } else {
                TemporalConsistency::ConsistentElevatedRisk
            }
        } else {
            TemporalConsistency::Moderate
        }
    }
}

fn merge_indicators(verdicts: &[UnitVerdict]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for indicator in verdicts.iter().flat_map(|v| v.indicators.iter()) {
        if !merged.iter().any(|m| m.eq_ignore_ascii_case(indicator)) {
            merged.push(indicator.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(index: usize, is_deepfake: bool, score: f64) -> UnitVerdict {
        UnitVerdict {
            index,
            is_deepfake,
            confidence_score: score,
            indicators: Vec::new(),
            suspicious_areas: Vec::new(),
            raw_explanation: String::new(),
        }
    }

    #[test]
    fn test_single_image_copies_verdict() {
        let mut v = verdict(0, true, 83.5);
        v.indicators = vec!["asymmetric earrings".to_string()];

        let report = Aggregator::default()
            .aggregate(MediaKind::Image, vec![v.clone()], 0)
            .unwrap();

        assert!(report.overall_is_deepfake);
        assert_eq!(report.overall_confidence_score, 83.5);
        assert_eq!(report.indicators, v.indicators);
        assert_eq!(report.suspicious_unit_count, 1);
        assert!(report.temporal_consistency_note.is_none());
        assert!(report.confidence_variance.is_none());
        assert_eq!(report.unit_verdicts, vec![v]);
    }

    #[test]
    fn test_even_split_is_inconclusive_not_deepfake() {
        let verdicts = vec![
            verdict(0, true, 70.0),
            verdict(10, false, 60.0),
            verdict(20, true, 75.0),
            verdict(30, false, 55.0),
        ];
        let report = Aggregator::default()
            .aggregate(MediaKind::Video, verdicts, 0)
            .unwrap();

        assert!(!report.overall_is_deepfake);
        assert_eq!(report.suspicious_unit_count, 2);
        assert!(report.verdict_note.as_deref().unwrap().contains("inconclusive"));
    }

    #[test]
    fn test_majority_is_deepfake() {
        let verdicts = vec![
            verdict(0, true, 80.0),
            verdict(1, true, 90.0),
            verdict(2, false, 40.0),
        ];
        let report = Aggregator::default()
            .aggregate(MediaKind::Video, verdicts, 1)
            .unwrap();

        assert!(report.overall_is_deepfake);
        assert!(report.verdict_note.is_none());
        assert_eq!(report.failure_count, 1);
        assert!((report.overall_confidence_score - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_suspicious_units_has_no_note() {
        let verdicts = vec![verdict(0, false, 90.0), verdict(5, false, 88.0)];
        let report = Aggregator::default()
            .aggregate(MediaKind::Video, verdicts, 0)
            .unwrap();

        assert!(!report.overall_is_deepfake);
        assert!(report.verdict_note.is_none());
        assert_eq!(report.temporal_consistency, Some(TemporalConsistency::ConsistentLowRisk));
        assert_eq!(report.temporal_consistency_note.as_deref(), Some("consistent, low risk"));
    }

    #[test]
    fn test_high_variance_is_inconsistent() {
        let verdicts = vec![
            verdict(0, false, 95.0),
            verdict(1, true, 95.0),
            verdict(2, false, 90.0),
            verdict(3, true, 90.0),
        ];
        let report = Aggregator::default()
            .aggregate(MediaKind::Video, verdicts, 0)
            .unwrap();

        assert_eq!(report.temporal_consistency, Some(TemporalConsistency::Inconsistent));
        assert!(report.confidence_variance.unwrap() > 400.0);
    }

    #[test]
    fn test_thresholds_are_tunable() {
        let strict = Aggregator::new(AggregatePolicy {
            majority_threshold: 0.25,
            low_variance: 1.0,
            high_variance: 2.0,
            low_risk_mean: 50.0,
        });
        // 风险 60 / 62 / 62.5，方差约 1.17
        let verdicts = vec![
            verdict(0, true, 60.0),
            verdict(1, false, 38.0),
            verdict(2, false, 37.5),
        ];
        let report = strict.aggregate(MediaKind::Video, verdicts, 0).unwrap();

        assert!(report.overall_is_deepfake);
        let variance = report.confidence_variance.unwrap();
        assert!(variance > 1.0 && variance < 2.0, "variance {}", variance);
        assert_eq!(report.temporal_consistency, Some(TemporalConsistency::Moderate));
    }

    #[test]
    fn test_confidently_authentic_video_is_low_risk() {
        let verdicts = (0..5).map(|i| verdict(i * 10, false, 95.0)).collect();
        let report = Aggregator::default()
            .aggregate(MediaKind::Video, verdicts, 0)
            .unwrap();

        assert!(!report.overall_is_deepfake);
        assert_eq!(report.overall_confidence_score, 95.0);
        assert_eq!(report.temporal_consistency, Some(TemporalConsistency::ConsistentLowRisk));
        assert_eq!(report.temporal_consistency_note.as_deref(), Some("consistent, low risk"));
        assert_eq!(report.confidence_variance, Some(0.0));
    }

    #[test]
    fn test_confidently_fake_video_is_elevated_risk() {
        let verdicts = vec![verdict(0, true, 88.0), verdict(1, true, 92.0)];
        let report = Aggregator::default()
            .aggregate(MediaKind::Video, verdicts, 0)
            .unwrap();

        assert!(report.overall_is_deepfake);
        assert_eq!(
            report.temporal_consistency,
            Some(TemporalConsistency::ConsistentElevatedRisk)
        );
    }

    #[test]
    fn test_consistent_high_scores_are_elevated_risk() {
        let aggregator = Aggregator::default();
        assert_eq!(
            aggregator.classify_temporal(85.0, 4.0),
            TemporalConsistency::ConsistentElevatedRisk
        );
    }

    #[test]
    fn test_order_is_preserved() {
        let verdicts = vec![
            verdict(0, false, 20.0),
            verdict(9, true, 99.0),
            verdict(18, false, 1.0),
        ];
        let report = Aggregator::default()
            .aggregate(MediaKind::Video, verdicts, 0)
            .unwrap();
        let order: Vec<usize> = report.unit_verdicts.iter().map(|v| v.index).collect();
        assert_eq!(order, vec![0, 9, 18]);
    }

    #[test]
    fn test_indicators_are_merged_in_first_seen_order() {
        let mut a = verdict(0, true, 70.0);
        a.indicators = vec!["blur at hairline".into(), "eye glint mismatch".into()];
        let mut b = verdict(1, true, 72.0);
        b.indicators = vec!["Eye glint mismatch".into(), "warped earring".into()];

        let report = Aggregator::default()
            .aggregate(MediaKind::Video, vec![a, b], 0)
            .unwrap();
        assert_eq!(
            report.indicators,
            vec!["blur at hairline", "eye glint mismatch", "warped earring"]
        );
    }

    #[test]
    fn test_total_failure_is_error() {
        let result = Aggregator::default().aggregate(MediaKind::Video, Vec::new(), 10);
        assert!(matches!(result, Err(DetectError::Aggregation(_))));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let verdicts = vec![
            verdict(0, true, 66.0),
            verdict(3, false, 33.0),
            verdict(6, true, 81.0),
        ];
        let aggregator = Aggregator::default();
        let first = aggregator.aggregate(MediaKind::Video, verdicts.clone(), 2).unwrap();
        let second = aggregator.aggregate(MediaKind::Video, verdicts, 2).unwrap();
        assert_eq!(first, second);
    }
}
