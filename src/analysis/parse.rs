//! 模型响应解析
//!
//! 模型并不总是严格返回 JSON：可能包在代码块或说明文字里、被截断、
//! 换了字段名或把数字写成字符串。这里尽量恢复出判断和分数，
//! 两者都拿不到时返回可重试的 `AnalysisService` 错误，不做静默兜底。

use serde_json::{Map, Value};

use super::UnitVerdict;
use crate::error::DetectError;

const VERDICT_KEYS: &[&str] = &["isdeepfake", "deepfake", "isfake", "isaigenerated", "verdict"];
const SCORE_KEYS: &[&str] = &["confidencescore", "confidence", "score"];
const EXPLANATION_KEYS: &[&str] = &["analysis", "explanation", "reasoning", "summary"];
const INDICATOR_KEYS: &[&str] = &["indicators", "signs", "findings"];
const AREA_KEYS: &[&str] = &["suspiciousareas", "areas"];

/// 将模型的文本响应解析为 UnitVerdict
pub fn parse_verdict(index: usize, text: &str) -> Result<UnitVerdict, DetectError> {
    if let Some(obj) = extract_json_object(text) {
        if let Some(verdict) = from_object(index, &obj, text) {
            return Ok(verdict);
        }
    }

    from_fragments(index, text).ok_or_else(|| {
        let preview: String = text.chars().take(120).collect();
        DetectError::service(format!("无法解析模型响应: {:?}", preview))
    })
}

/// 取第一个 `{` 到最后一个 `}` 之间的内容
fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]).ok()? {
        Value::Object(obj) => Some(obj),
        _ => None,
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|wanted| {
        obj.iter()
            .find(|(key, _)| normalize_key(key) == *wanted)
            .map(|(_, value)| value)
    })
}

fn from_object(index: usize, obj: &Map<String, Value>, text: &str) -> Option<UnitVerdict> {
    let is_deepfake = lookup(obj, VERDICT_KEYS).and_then(value_as_bool)?;
    let confidence_score = lookup(obj, SCORE_KEYS).and_then(value_as_score)?;

    let raw_explanation = lookup(obj, EXPLANATION_KEYS)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| text.trim().to_string());

    Some(UnitVerdict {
        index,
        is_deepfake,
        confidence_score,
        indicators: lookup(obj, INDICATOR_KEYS).map(value_as_strings).unwrap_or_default(),
        suspicious_areas: lookup(obj, AREA_KEYS).map(value_as_strings).unwrap_or_default(),
        raw_explanation,
    })
}

/// 半结构化文本：按 `key: value` / `key = value` 片段扫描
fn from_fragments(index: usize, text: &str) -> Option<UnitVerdict> {
    let mut is_deepfake = None;
    let mut confidence_score = None;

    for fragment in text.split(&['\n', ',', '{', '}', ';'][..]) {
        let Some((key, value)) = fragment.split_once(&[':', '='][..]) else {
            continue;
        };
        let key = normalize_key(key);
        let value = value
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '`')
            .trim();

        if is_deepfake.is_none() && VERDICT_KEYS.contains(&key.as_str()) {
            is_deepfake = str_as_bool(value);
        } else if confidence_score.is_none() && SCORE_KEYS.contains(&key.as_str()) {
            confidence_score = str_as_score(value);
        }
    }

    Some(UnitVerdict {
        index,
        is_deepfake: is_deepfake?,
        confidence_score: confidence_score?,
        indicators: Vec::new(),
        suspicious_areas: Vec::new(),
        raw_explanation: text.trim().to_string(),
    })
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => str_as_bool(s),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}

fn str_as_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "fake" | "deepfake" | "manipulated" | "ai-generated" => Some(true),
        "false" | "no" | "0" | "real" | "authentic" | "genuine" => Some(false),
        _ => None,
    }
}

fn value_as_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().and_then(|raw| normalize_score(raw, n.is_f64())),
        Value::String(s) => str_as_score(s),
        _ => None,
    }
}

fn str_as_score(s: &str) -> Option<f64> {
    let s = s.trim();
    let (number, percent) = match s.strip_suffix('%') {
        Some(rest) => (rest.trim(), true),
        None => (s, false),
    };
    let raw: f64 = number.parse().ok()?;
    if percent {
        raw.is_finite().then(|| raw.clamp(0.0, 100.0))
    } else {
        normalize_score(raw, number.contains('.'))
    }
}

/// 写成小数的 (0,1] 视为比例，换算成百分制；整数 1 仍是 1 分。结果限制在 [0,100]
fn normalize_score(raw: f64, decimal: bool) -> Option<f64> {
    if !raw.is_finite() {
        return None;
    }
    let fraction = raw > 0.0 && (raw < 1.0 || (decimal && raw == 1.0));
    let scaled = if fraction { raw * 100.0 } else { raw };
    Some(scaled.clamp(0.0, 100.0))
}

fn value_as_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::String(_) | Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}
