use image::DynamicImage;
use tracing::{debug, info};

use crate::error::DetectError;
use crate::media::MediaUnit;

/// 默认每个视频最多采样的帧数
pub const DEFAULT_MAX_FRAMES: usize = 10;

/// 解码得到的一帧
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// 帧序号（解码顺序）
    pub position: usize,
    /// 时间戳（秒）
    pub timestamp: Option<f64>,
    pub image: DynamicImage,
}

/// 视频帧来源
///
/// 生产环境由 FFmpeg 实现；测试中可以用内存帧替代。
pub trait FrameSource {
    /// 视频总帧数
    fn total_frames(&self) -> usize;

    /// 解码指定位置的帧，无法解码的位置直接跳过
    fn decode_at(&mut self, positions: &[usize]) -> Result<Vec<DecodedFrame>, DetectError>;
}

/// 均匀间隔的帧采样器
///
/// 采样间隔 = max(1, 总帧数 / 最大帧数)，从第 0 帧开始按间隔取帧，直到达到上限。
/// 相同输入总是得到相同的采样位置。
#[derive(Debug, Clone, Copy)]
pub struct FrameSampler {
    max_frames: usize,
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES)
    }
}

impl FrameSampler {
    pub fn new(max_frames: usize) -> Self {
        Self {
            max_frames: max_frames.max(1),
        }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn stride(&self, total_frames: usize) -> usize {
        (total_frames / self.max_frames).max(1)
    }

    /// 计算采样位置
    pub fn plan(&self, total_frames: usize) -> Vec<usize> {
        (0..total_frames)
            .step_by(self.stride(total_frames))
            .take(self.max_frames)
            .collect()
    }

    /// 从视频中采样帧，返回按帧序号排列的分析单元
    pub fn sample(&self, source: &mut dyn FrameSource) -> Result<Vec<MediaUnit>, DetectError> {
        let total = source.total_frames();
        if total == 0 {
            return Err(DetectError::EmptyVideo);
        }

        let positions = self.plan(total);
        info!(
            "📊 帧采样: 总帧数 {}，间隔 {}，计划采样 {} 帧",
            total,
            self.stride(total),
            positions.len()
        );

        let mut frames = source.decode_at(&positions)?;
        frames.retain(|frame| positions.binary_search(&frame.position).is_ok());
        frames.sort_by_key(|frame| frame.position);
        frames.dedup_by_key(|frame| frame.position);

        if frames.is_empty() {
            return Err(DetectError::EmptyVideo);
        }
        if frames.len() < positions.len() {
            debug!("{} 个采样位置未能解码", positions.len() - frames.len());
        }

        Ok(frames
            .into_iter()
            .map(|frame| MediaUnit::frame(frame.position, frame.timestamp, frame.image))
            .collect())
    }
}
