//! 检测编排
//!
//! 每个请求按 `Pending → Validating → Sampling（仅视频）→ Analyzing → Aggregating → Done`
//! 推进，任意非终态都可以进入 `Failed`。分析阶段每个单元一个任务，并发受信号量限制，
//! 结果按采样位置写回，与完成顺序无关。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::{AggregateReport, Aggregator};
use crate::analysis::{Classifier, GeminiClassifier, UnitVerdict};
use crate::config::DetectConfig;
use crate::error::{DetectError, ErrorKind};
use crate::media::{self, MediaInfo, MediaKind, MediaUnit, ScratchFile, ValidatedMedia};
use crate::sampler::{FrameSampler, FrameSource};

/// 请求所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Validating,
    Sampling,
    Analyzing,
    Aggregating,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// 合法的状态迁移
    pub fn can_advance_to(&self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Validating) | (Pending, Sampling) => true,
            (Validating, Sampling) | (Validating, Analyzing) => true,
            (Sampling, Analyzing) => true,
            (Analyzing, Aggregating) => true,
            (Aggregating, Done) => true,
            _ => false,
        }
    }
}

/// 请求状态，终态携带结果或错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Validating,
    Sampling,
    Analyzing { units: usize },
    Aggregating,
    Done { report: AggregateReport },
    Failed { kind: ErrorKind, message: String },
}

impl RequestState {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Pending => Stage::Pending,
            Self::Validating => Stage::Validating,
            Self::Sampling => Stage::Sampling,
            Self::Analyzing { .. } => Stage::Analyzing,
            Self::Aggregating => Stage::Aggregating,
            Self::Done { .. } => Stage::Done,
            Self::Failed { .. } => Stage::Failed,
        }
    }
}

/// 一次检测请求
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub id: Uuid,
    state: RequestState,
    history: Vec<Stage>,
    /// 校验阶段得到的媒体信息
    pub media: Option<MediaInfo>,
    started: Instant,
    elapsed: Duration,
}

impl Default for DetectionRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionRequest {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RequestState::Pending,
            history: vec![Stage::Pending],
            media: None,
            started: Instant::now(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn state(&self) -> &RequestState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    /// 经历过的全部阶段（含当前阶段）
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn report(&self) -> Option<&AggregateReport> {
        match &self.state {
            RequestState::Done { report } => Some(report),
            _ => None,
        }
    }

    /// 推进状态，非法迁移返回 `Internal`
    pub fn advance(&mut self, next: RequestState) -> Result<(), DetectError> {
        let (from, to) = (self.stage(), next.stage());
        if !from.can_advance_to(to) {
            return Err(DetectError::Internal(format!(
                "非法状态迁移: {:?} -> {:?}",
                from, to
            )));
        }
        debug!("请求 {} 状态: {:?} -> {:?}", self.id, from, to);
        self.state = next;
        self.history.push(to);
        self.elapsed = self.started.elapsed();
        Ok(())
    }

    fn finish(&mut self, result: Result<AggregateReport, DetectError>) {
        let next = match result {
            Ok(report) => RequestState::Done { report },
            Err(e) => {
                error!("❌ [检测] 请求 {} 失败: {}", self.id, e);
                RequestState::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };
        if let Err(e) = self.advance(next) {
            // 只会在 Aggregating 以外的阶段拿到 Ok 时发生
            error!("{}", e);
            self.state = RequestState::Failed {
                kind: e.kind(),
                message: e.to_string(),
            };
            self.history.push(Stage::Failed);
        }
    }
}

/// 单元级重试参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// 首次失败后的额外尝试次数
    pub retry_count: u32,
    pub backoff: Duration,
    /// 单次尝试超时
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DetectConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            backoff: config.retry_backoff(),
            attempt_timeout: config.request_timeout(),
        }
    }

    /// 第 n 次重试前的等待时间：backoff * 2^n
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// 分析单个单元，可重试错误按指数退避重试
pub async fn analyze_with_retry(
    classifier: &dyn Classifier,
    unit: &MediaUnit,
    policy: RetryPolicy,
) -> Result<UnitVerdict, DetectError> {
    let mut attempt = 0u32;
    loop {
        let result = tokio::time::timeout(policy.attempt_timeout, classifier.analyze_unit(unit))
            .await
            .unwrap_or(Err(DetectError::AnalysisTimeout(policy.attempt_timeout)));

        match result {
            Ok(verdict) => return Ok(verdict),
            Err(e) if e.is_retryable() && attempt < policy.retry_count => {
                let delay = policy.delay(attempt);
                warn!(
                    "⚠️  [分析] 单元 {} 第 {} 次尝试失败: {}，{}ms 后重试",
                    unit.index,
                    attempt + 1,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

type JoinedUnit = Result<(usize, Result<UnitVerdict, DetectError>), JoinError>;

/// 分析阶段的汇总结果
struct AnalysisOutcome {
    /// 按采样顺序排列
    verdicts: Vec<UnitVerdict>,
    failures: usize,
    last_error: Option<DetectError>,
    deadline_hit: bool,
}

/// 检测编排器
///
/// 不持有任何按用户区分的可变状态，可以在多个请求之间共享。
pub struct Detector {
    classifier: Arc<dyn Classifier>,
    config: DetectConfig,
    sampler: FrameSampler,
    aggregator: Aggregator,
}

impl Detector {
    pub fn new(classifier: Arc<dyn Classifier>, config: DetectConfig) -> Self {
        Self {
            classifier,
            sampler: FrameSampler::new(config.max_frames_per_video),
            aggregator: Aggregator::new(config.aggregate_policy()),
            config,
        }
    }

    /// 使用 Gemini 分类器创建编排器
    pub fn with_gemini(
        client: reqwest::Client,
        api_key: impl Into<String>,
        config: DetectConfig,
    ) -> Result<Self, DetectError> {
        let classifier = GeminiClassifier::new(
            client,
            api_key,
            config.base_url.clone(),
            config.model.clone(),
            config.request_timeout(),
        )?;
        Ok(Self::new(Arc::new(classifier), config))
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// 检测一个上传的媒体文件
    ///
    /// 返回的请求总是处于终态：`Done` 携带报告，`Failed` 携带错误类别和信息。
    pub async fn detect(&self, file_bytes: Vec<u8>, declared_type: &str) -> DetectionRequest {
        let mut request = DetectionRequest::new();
        info!(
            "🔍 [检测] 请求 {} 开始: {} ({} 字节)",
            request.id,
            declared_type,
            file_bytes.len()
        );
        let deadline = self.deadline();
        let result = self.run(&mut request, file_bytes, declared_type, deadline).await;
        request.finish(result);
        self.log_finished(&request);
        request
    }

    /// 检测本地文件，类型由文件名推断
    pub async fn detect_path(&self, path: &Path) -> DetectionRequest {
        let declared = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // 不支持的类型不必读文件
        if let Err(e) = media::classify(&declared) {
            return Self::rejected(e);
        }

        match tokio::fs::read(path).await {
            Ok(bytes) => self.detect(bytes, &declared).await,
            Err(e) => Self::rejected(DetectError::CorruptMedia(format!(
                "无法读取文件 {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// 直接对一个帧源做检测（跳过格式校验）
    pub async fn detect_frames<S>(&self, source: S) -> DetectionRequest
    where
        S: FrameSource + Send + 'static,
    {
        let mut request = DetectionRequest::new();
        let deadline = self.deadline();
        let result = self.run_frames(&mut request, source, deadline).await;
        request.finish(result);
        self.log_finished(&request);
        request
    }

    /// 整体截止时间从请求开始计时，覆盖校验、采样和分析
    fn deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.config.total_timeout()
    }

    /// 截止时间前等待阻塞任务；超时后任务在后台结束，结果被丢弃
    async fn blocking_until<T>(
        &self,
        deadline: tokio::time::Instant,
        what: &str,
        task: impl FnOnce() -> Result<T, DetectError> + Send + 'static,
    ) -> Result<T, DetectError>
    where
        T: Send + 'static,
    {
        match tokio::time::timeout_at(deadline, tokio::task::spawn_blocking(task)).await {
            Ok(joined) => joined
                .map_err(|e| DetectError::Internal(format!("{}任务异常退出: {}", what, e)))?,
            Err(_) => {
                warn!("⏳ [检测] {}阶段超过整体截止时间", what);
                Err(DetectError::AnalysisTimeout(self.config.total_timeout()))
            }
        }
    }

    fn rejected(e: DetectError) -> DetectionRequest {
        let mut request = DetectionRequest::new();
        request.finish(Err(e));
        request
    }

    async fn run(
        &self,
        request: &mut DetectionRequest,
        file_bytes: Vec<u8>,
        declared_type: &str,
        deadline: tokio::time::Instant,
    ) -> Result<AggregateReport, DetectError> {
        request.advance(RequestState::Validating)?;
        let stage_start = Instant::now();
        let declared = declared_type.to_string();
        let validated = self
            .blocking_until(deadline, "校验", move || media::validate(file_bytes, &declared))
            .await?;

        let info = validated.info().clone();
        info!(
            "✅ [检测] 校验完成: {:?} {} {}x{}，耗时: {:.2}秒",
            info.kind,
            info.format,
            info.width,
            info.height,
            stage_start.elapsed().as_secs_f64()
        );
        request.media = Some(info);

        let (kind, units) = match validated {
            ValidatedMedia::Image { unit, .. } => (MediaKind::Image, vec![unit]),
            ValidatedMedia::Video { source, scratch, .. } => {
                request.advance(RequestState::Sampling)?;
                let units = self.sample_blocking(source, Some(scratch), deadline).await?;
                (MediaKind::Video, units)
            }
        };

        self.analyze_and_aggregate(request, kind, units, deadline).await
    }

    async fn run_frames<S>(
        &self,
        request: &mut DetectionRequest,
        source: S,
        deadline: tokio::time::Instant,
    ) -> Result<AggregateReport, DetectError>
    where
        S: FrameSource + Send + 'static,
    {
        request.advance(RequestState::Sampling)?;
        let units = self.sample_blocking(source, None, deadline).await?;
        self.analyze_and_aggregate(request, MediaKind::Video, units, deadline)
            .await
    }

    /// 在阻塞线程池中解码采样帧；临时文件在解码结束后删除
    async fn sample_blocking<S>(
        &self,
        source: S,
        scratch: Option<ScratchFile>,
        deadline: tokio::time::Instant,
    ) -> Result<Vec<MediaUnit>, DetectError>
    where
        S: FrameSource + Send + 'static,
    {
        let sampler = self.sampler;
        let stage_start = Instant::now();
        let units = self
            .blocking_until(deadline, "采样", move || {
                let mut source = source;
                let units = sampler.sample(&mut source);
                drop(scratch);
                units
            })
            .await?;

        info!(
            "✅ [检测] 采样完成: {} 帧，耗时: {:.2}秒",
            units.len(),
            stage_start.elapsed().as_secs_f64()
        );
        Ok(units)
    }

    async fn analyze_and_aggregate(
        &self,
        request: &mut DetectionRequest,
        kind: MediaKind,
        units: Vec<MediaUnit>,
        deadline: tokio::time::Instant,
    ) -> Result<AggregateReport, DetectError> {
        let unit_count = units.len();
        request.advance(RequestState::Analyzing { units: unit_count })?;

        let stage_start = Instant::now();
        let outcome = self.analyze_units(units, deadline).await;
        info!(
            "✅ [检测] 分析完成: 成功 {}，失败 {}，耗时: {:.2}秒",
            outcome.verdicts.len(),
            outcome.failures,
            stage_start.elapsed().as_secs_f64()
        );

        if outcome.verdicts.is_empty() {
            return Err(match outcome.last_error {
                Some(e) => DetectError::service_fatal(format!(
                    "全部 {} 个单元分析失败，最后一个错误: {}",
                    unit_count, e
                )),
                None if outcome.deadline_hit => DetectError::service_fatal(format!(
                    "{} 秒内没有任何单元完成分析",
                    self.config.total_timeout_seconds
                )),
                None => DetectError::service_fatal("没有可分析的单元"),
            });
        }

        request.advance(RequestState::Aggregating)?;
        self.aggregator
            .aggregate(kind, outcome.verdicts, outcome.failures)
    }

    /// 并发分析所有单元
    ///
    /// 到达整体截止时间后取消仍在进行的任务，未完成的单元计为失败。
    async fn analyze_units(
        &self,
        units: Vec<MediaUnit>,
        deadline: tokio::time::Instant,
    ) -> AnalysisOutcome {
        let total = units.len();
        let policy = RetryPolicy::from_config(&self.config);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut tasks = JoinSet::new();
        for (slot, unit) in units.into_iter().enumerate() {
            let classifier = Arc::clone(&self.classifier);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (slot, Err(DetectError::Internal("并发许可已关闭".to_string())))
                    }
                };
                let result = analyze_with_retry(classifier.as_ref(), &unit, policy).await;
                (slot, result)
            });
        }

        let mut slots: Vec<Option<UnitVerdict>> = vec![None; total];
        let mut failures = 0;
        let mut last_error = None;
        let mut deadline_hit = false;

        let mut record = |joined: JoinedUnit, slots: &mut Vec<Option<UnitVerdict>>| match joined {
            Ok((slot, Ok(verdict))) => slots[slot] = Some(verdict),
            Ok((slot, Err(e))) => {
                warn!("⚠️  [分析] 单元 #{} 放弃: {}", slot, e);
                failures += 1;
                last_error = Some(e);
            }
            Err(join_error) => {
                if !join_error.is_cancelled() {
                    error!("❌ [分析] 分析任务异常退出: {}", join_error);
                }
                failures += 1;
            }
        };

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => record(joined, &mut slots),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "⏳ [分析] 到达整体截止时间，取消 {} 个未完成的单元",
                        tasks.len()
                    );
                    deadline_hit = true;
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        record(joined, &mut slots);
                    }
                    break;
                }
            }
        }

        AnalysisOutcome {
            verdicts: slots.into_iter().flatten().collect(),
            failures,
            last_error,
            deadline_hit,
        }
    }

    fn log_finished(&self, request: &DetectionRequest) {
        match request.state() {
            RequestState::Done { report } => info!(
                "📊 [检测] 请求 {} 完成: 伪造={}，置信度 {:.1}，耗时: {:.2}秒",
                request.id,
                report.overall_is_deepfake,
                report.overall_confidence_score,
                request.elapsed().as_secs_f64()
            ),
            RequestState::Failed { kind, .. } => debug!(
                "请求 {} 以 {:?} 结束，耗时: {:.2}秒",
                request.id,
                kind,
                request.elapsed().as_secs_f64()
            ),
            _ => {}
        }
    }
}
