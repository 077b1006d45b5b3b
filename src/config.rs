use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::AggregatePolicy;
use crate::analysis::GeminiClassifier;
use crate::sampler::DEFAULT_MAX_FRAMES;

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "deepfake-detect.ini";
/// 环境变量前缀
const ENV_PREFIX: &str = "DEEPFAKE_DETECT_";

/// 检测配置
#[derive(Debug, Clone, PartialEq)]
pub struct DetectConfig {
    /// 每个视频最多分析的帧数
    pub max_frames_per_video: usize,
    /// 可疑帧比例超过该值判为伪造
    pub majority_threshold: f64,
    /// 单元失败后的额外重试次数
    pub retry_count: u32,
    /// 重试退避基数（毫秒），第 n 次重试等待 base * 2^n
    pub retry_backoff_ms: u64,
    /// 单次分析请求超时（秒）
    pub request_timeout_seconds: u64,
    /// 整个检测请求的截止时间（秒）
    pub total_timeout_seconds: u64,
    /// 同时进行的分析请求上限
    pub max_concurrency: usize,
    pub low_variance: f64,
    pub high_variance: f64,
    pub low_risk_mean: f64,
    /// Gemini 模型名
    pub model: String,
    /// Gemini API 根地址
    pub base_url: String,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
    /// `/detect/direct` 只能读取该目录下的文件；未设置时该接口关闭
    pub direct_root: Option<PathBuf>,
}

impl Default for DetectConfig {
    fn default() -> Self {
        let policy = AggregatePolicy::default();
        Self {
            max_frames_per_video: DEFAULT_MAX_FRAMES,
            majority_threshold: policy.majority_threshold,
            retry_count: 2,
            retry_backoff_ms: 200,
            request_timeout_seconds: 60,
            total_timeout_seconds: 300,
            max_concurrency: 4,
            low_variance: policy.low_variance,
            high_variance: policy.high_variance,
            low_risk_mean: policy.low_risk_mean,
            model: GeminiClassifier::DEFAULT_MODEL.to_string(),
            base_url: GeminiClassifier::DEFAULT_BASE_URL.to_string(),
            log_level: "info".to_string(),
            direct_root: None,
        }
    }
}

impl DetectConfig {
    pub fn aggregate_policy(&self) -> AggregatePolicy {
        AggregatePolicy {
            majority_threshold: self.majority_threshold,
            low_variance: self.low_variance,
            high_variance: self.high_variance,
            low_risk_mean: self.low_risk_mean,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// 检查配置取值是否合理
    pub fn validate(&self) -> Result<()> {
        if self.max_frames_per_video == 0 {
            anyhow::bail!("max_frames_per_video 必须大于 0");
        }
        if !(0.0..1.0).contains(&self.majority_threshold) {
            anyhow::bail!("majority_threshold 必须在 [0, 1) 之间: {}", self.majority_threshold);
        }
        if self.low_variance > self.high_variance {
            anyhow::bail!(
                "low_variance ({}) 不能大于 high_variance ({})",
                self.low_variance,
                self.high_variance
            );
        }
        if self.request_timeout_seconds == 0 || self.total_timeout_seconds == 0 {
            anyhow::bail!("超时时间必须大于 0");
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency 必须大于 0");
        }
        if self.model.trim().is_empty() {
            anyhow::bail!("model 不能为空");
        }
        Ok(())
    }

    fn apply(&mut self, layer: PartialConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = layer.$field { self.$field = v; })*
            };
        }
        take!(
            max_frames_per_video,
            majority_threshold,
            retry_count,
            retry_backoff_ms,
            request_timeout_seconds,
            total_timeout_seconds,
            max_concurrency,
            low_variance,
            high_variance,
            low_risk_mean,
            model,
            base_url,
            log_level,
        );
        if let Some(root) = layer.direct_root {
            self.direct_root = Some(root);
        }
    }
}

/// 单个配置来源中出现的字段，未出现的为 None
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialConfig {
    pub max_frames_per_video: Option<usize>,
    pub majority_threshold: Option<f64>,
    pub retry_count: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub request_timeout_seconds: Option<u64>,
    pub total_timeout_seconds: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub low_variance: Option<f64>,
    pub high_variance: Option<f64>,
    pub low_risk_mean: Option<f64>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub log_level: Option<String>,
    pub direct_root: Option<PathBuf>,
}

impl PartialConfig {
    /// 从环境变量读取；`lookup` 便于测试注入
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        Self {
            max_frames_per_video: parsed(get("MAX_FRAMES")),
            majority_threshold: parsed(get("MAJORITY_THRESHOLD")),
            retry_count: parsed(get("RETRY_COUNT")),
            retry_backoff_ms: parsed(get("RETRY_BACKOFF_MS")),
            request_timeout_seconds: parsed(get("REQUEST_TIMEOUT")),
            total_timeout_seconds: parsed(get("TOTAL_TIMEOUT")),
            max_concurrency: parsed(get("MAX_CONCURRENCY")),
            low_variance: parsed(get("LOW_VARIANCE")),
            high_variance: parsed(get("HIGH_VARIANCE")),
            low_risk_mean: parsed(get("LOW_RISK_MEAN")),
            model: get("MODEL"),
            base_url: get("BASE_URL"),
            log_level: lookup("LOG_LEVEL")
                .or_else(|| get("LOG_LEVEL"))
                .filter(|v| !v.trim().is_empty()),
            direct_root: get("DIRECT_ROOT").map(PathBuf::from),
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_with(|name| env::var(name).ok())
    }

    /// 从 INI 文件读取
    ///
    /// 各字段按所属节读取，节中没有时回退到 [DEFAULT]。
    pub fn from_ini(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            anyhow::bail!("配置文件不存在: {}", config_path.display());
        }

        let mut ini = configparser::ini::Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        let get = |section: &str, key: &str| {
            ini.get(section, key)
                .or_else(|| ini.get("default", key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let parse = |section: &str, key: &str| -> Result<Option<f64>> {
            get(section, key)
                .map(|v| v.parse::<f64>().with_context(|| format!("[{}] {} 不是数字: {}", section, key, v)))
                .transpose()
        };
        let parse_int = |section: &str, key: &str| -> Result<Option<u64>> {
            get(section, key)
                .map(|v| v.parse::<u64>().with_context(|| format!("[{}] {} 不是整数: {}", section, key, v)))
                .transpose()
        };

        Ok(Self {
            max_frames_per_video: parse_int("detect", "max_frames_per_video")?.map(|v| v as usize),
            retry_count: parse_int("detect", "retry_count")?.map(|v| v as u32),
            retry_backoff_ms: parse_int("detect", "retry_backoff_ms")?,
            request_timeout_seconds: parse_int("detect", "request_timeout_seconds")?,
            total_timeout_seconds: parse_int("detect", "total_timeout_seconds")?,
            max_concurrency: parse_int("detect", "max_concurrency")?.map(|v| v as usize),
            majority_threshold: parse("aggregate", "majority_threshold")?,
            low_variance: parse("aggregate", "low_variance")?,
            high_variance: parse("aggregate", "high_variance")?,
            low_risk_mean: parse("aggregate", "low_risk_mean")?,
            model: get("gemini", "model"),
            base_url: get("gemini", "base_url"),
            log_level: get("logging", "level"),
            direct_root: get("server", "direct_root").map(PathBuf::from),
        })
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_frames: Option<usize>,
    pub retry_count: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub log_level: Option<String>,
    pub direct_root: Option<PathBuf>,
}

impl From<CliOverrides> for PartialConfig {
    fn from(cli: CliOverrides) -> Self {
        Self {
            max_frames_per_video: cli.max_frames,
            retry_count: cli.retry_count,
            request_timeout_seconds: cli.timeout_seconds,
            log_level: cli.log_level,
            direct_root: cli.direct_root,
            ..Self::default()
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, cli: CliOverrides) -> Result<DetectConfig> {
        // 显式指定的配置文件必须能读取；默认位置找不到时忽略
        let file_layer = match config_file {
            Some(path) => Some(PartialConfig::from_ini(path)?),
            None => Self::find_default_config()
                .map(|path| PartialConfig::from_ini(&path))
                .transpose()?,
        };

        Self::merge(file_layer, PartialConfig::from_env(), cli.into())
    }

    /// 按优先级合并各层配置并校验
    pub fn merge(
        file: Option<PartialConfig>,
        env: PartialConfig,
        cli: PartialConfig,
    ) -> Result<DetectConfig> {
        let mut config = DetectConfig::default();
        if let Some(file) = file {
            config.apply(file);
        }
        config.apply(env);
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    /// API key：命令行 > GEMINI_API_KEY > GOOGLE_API_KEY
    pub fn resolve_api_key(cli_key: Option<String>) -> Option<String> {
        Self::resolve_api_key_with(cli_key, |name| env::var(name).ok())
    }

    pub fn resolve_api_key_with<F>(cli_key: Option<String>, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        [cli_key, lookup("GEMINI_API_KEY"), lookup("GOOGLE_API_KEY")]
            .into_iter()
            .flatten()
            .map(|k| k.trim().to_string())
            .find(|k| !k.is_empty())
    }

    /// 默认位置：./deepfake-detect.ini、./.deepfake-detect.ini、~/.deepfake-detect.ini、/etc/deepfake-detect.ini
    fn find_default_config() -> Option<PathBuf> {
        let hidden = format!(".{}", CONFIG_FILE_NAME);
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME), PathBuf::from(&hidden)];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(&hidden));
        }
        candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));

        candidates.into_iter().find(|p| p.exists())
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = DetectConfig::default();
        let mut ini = configparser::ini::Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            ini.set(section, key, Some(value));
        };

        set("detect", "max_frames_per_video", defaults.max_frames_per_video.to_string());
        set("detect", "retry_count", defaults.retry_count.to_string());
        set("detect", "retry_backoff_ms", defaults.retry_backoff_ms.to_string());
        set("detect", "request_timeout_seconds", defaults.request_timeout_seconds.to_string());
        set("detect", "total_timeout_seconds", defaults.total_timeout_seconds.to_string());
        set("detect", "max_concurrency", defaults.max_concurrency.to_string());
        set("aggregate", "majority_threshold", defaults.majority_threshold.to_string());
        set("aggregate", "low_variance", defaults.low_variance.to_string());
        set("aggregate", "high_variance", defaults.high_variance.to_string());
        set("aggregate", "low_risk_mean", defaults.low_risk_mean.to_string());
        set("gemini", "model", defaults.model.clone());
        set("gemini", "base_url", defaults.base_url.clone());
        set("logging", "level", defaults.log_level.clone());

        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DetectConfig::default();
        assert_eq!(config.max_frames_per_video, 10);
        assert_eq!(config.majority_threshold, 0.5);
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.model, "gemini-1.5-flash");
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregate_policy(), AggregatePolicy::default());
    }

    #[test]
    fn test_default_config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        ConfigLoader::create_default_config(&path).unwrap();

        let layer = PartialConfig::from_ini(&path).unwrap();
        let config = ConfigLoader::merge(Some(layer), PartialConfig::default(), PartialConfig::default())
            .unwrap();
        assert_eq!(config, DetectConfig::default());
    }

    #[test]
    fn test_ini_sections_and_default_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.ini");
        std::fs::write(
            &path,
            "[DEFAULT]\nretry_count = 5\n\n[detect]\nmax_frames_per_video = 6\n\n[aggregate]\nmajority_threshold = 0.6\n\n[gemini]\nmodel = gemini-1.5-pro\n",
        )
        .unwrap();

        let layer = PartialConfig::from_ini(&path).unwrap();
        assert_eq!(layer.max_frames_per_video, Some(6));
        assert_eq!(layer.retry_count, Some(5));
        assert_eq!(layer.majority_threshold, Some(0.6));
        assert_eq!(layer.model.as_deref(), Some("gemini-1.5-pro"));
        assert_eq!(layer.base_url, None);
        assert_eq!(layer.direct_root, None);
    }

    #[test]
    fn test_direct_root_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.ini");
        std::fs::write(&path, "[server]\ndirect_root = /srv/media\n").unwrap();

        let file = PartialConfig::from_ini(&path).unwrap();
        assert_eq!(file.direct_root, Some(PathBuf::from("/srv/media")));

        let env = PartialConfig::from_env_with(env_of(&[("DEEPFAKE_DETECT_DIRECT_ROOT", "/data")]));
        let config = ConfigLoader::merge(Some(file.clone()), env, PartialConfig::default()).unwrap();
        assert_eq!(config.direct_root, Some(PathBuf::from("/data")));

        let config =
            ConfigLoader::merge(Some(file), PartialConfig::default(), PartialConfig::default())
                .unwrap();
        assert_eq!(config.direct_root, Some(PathBuf::from("/srv/media")));
    }

    #[test]
    fn test_bad_number_in_ini_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ini");
        std::fs::write(&path, "[aggregate]\nlow_variance = lots\n").unwrap();
        assert!(PartialConfig::from_ini(&path).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.ini");
        assert!(ConfigLoader::load_config(Some(&missing), CliOverrides::default()).is_err());
    }

    #[test]
    fn test_env_layer() {
        let layer = PartialConfig::from_env_with(env_of(&[
            ("DEEPFAKE_DETECT_MAX_FRAMES", "4"),
            ("DEEPFAKE_DETECT_TOTAL_TIMEOUT", " 90 "),
            ("DEEPFAKE_DETECT_HIGH_VARIANCE", "not-a-number"),
            ("LOG_LEVEL", "debug"),
        ]));
        assert_eq!(layer.max_frames_per_video, Some(4));
        assert_eq!(layer.total_timeout_seconds, Some(90));
        assert_eq!(layer.high_variance, None);
        assert_eq!(layer.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_precedence_cli_over_env_over_file() {
        let file = PartialConfig {
            max_frames_per_video: Some(20),
            retry_count: Some(1),
            low_risk_mean: Some(40.0),
            ..Default::default()
        };
        let env = PartialConfig {
            max_frames_per_video: Some(15),
            retry_count: Some(3),
            ..Default::default()
        };
        let cli: PartialConfig = CliOverrides {
            max_frames: Some(8),
            ..Default::default()
        }
        .into();

        let config = ConfigLoader::merge(Some(file), env, cli).unwrap();
        assert_eq!(config.max_frames_per_video, 8);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.low_risk_mean, 40.0);
        assert_eq!(config.request_timeout_seconds, 60);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad = PartialConfig {
            low_variance: Some(500.0),
            ..Default::default()
        };
        assert!(ConfigLoader::merge(None, bad, PartialConfig::default()).is_err());

        let bad = PartialConfig {
            majority_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(ConfigLoader::merge(None, bad, PartialConfig::default()).is_err());
    }

    #[test]
    fn test_api_key_resolution() {
        let lookup = env_of(&[("GOOGLE_API_KEY", "from-google"), ("GEMINI_API_KEY", "  ")]);
        assert_eq!(
            ConfigLoader::resolve_api_key_with(Some("cli".into()), &lookup).as_deref(),
            Some("cli")
        );
        // 空白的 GEMINI_API_KEY 不会挡住后面的来源
        assert_eq!(
            ConfigLoader::resolve_api_key_with(None, &lookup).as_deref(),
            Some("from-google")
        );
        assert_eq!(ConfigLoader::resolve_api_key_with(None, env_of(&[])), None);
    }
}
