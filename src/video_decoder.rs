use ffmpeg_next as ffmpeg;
use image::DynamicImage;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::DetectError;
use crate::sampler::{DecodedFrame, FrameSource};

/// 基于 FFmpeg 的视频帧源
///
/// 只保存路径和探测到的视频信息，解码时再打开文件，因此可以整体移动到阻塞线程池中使用。
#[derive(Debug)]
pub struct FfmpegFrameSource {
    path: PathBuf,
    stream_index: usize,
    frame_count: usize,
    fps: Option<f64>,
    duration: Option<f64>,
    width: u32,
    height: u32,
}

fn init_ffmpeg() -> Result<(), DetectError> {
    ffmpeg::init().map_err(|e| DetectError::Internal(format!("初始化 FFmpeg 失败: {}", e)))?;
    // 只输出错误级别日志，避免解码警告刷屏
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    Ok(())
}

fn open_input(path: &Path) -> Result<ffmpeg::format::context::Input, DetectError> {
    ffmpeg::format::input(&path)
        .map_err(|e| DetectError::CorruptMedia(format!("无法打开视频文件: {}", e)))
}

impl FfmpegFrameSource {
    /// 打开并探测视频，失败视为文件损坏
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DetectError> {
        init_ffmpeg()?;
        let path = path.as_ref().to_path_buf();
        let mut ictx = open_input(&path)?;

        let (stream_index, reported_frames, fps, width, height) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| DetectError::CorruptMedia("未找到视频流".to_string()))?;

            let rate = stream.avg_frame_rate();
            let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
                Some(rate.numerator() as f64 / rate.denominator() as f64)
            } else {
                None
            };

            let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .and_then(|ctx| ctx.decoder().video())
                .map_err(|e| DetectError::CorruptMedia(format!("无法创建视频解码器: {}", e)))?;

            (
                stream.index(),
                stream.frames().max(0) as usize,
                fps,
                decoder.width(),
                decoder.height(),
            )
        };

        let duration = if ictx.duration() > 0 {
            Some(ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64)
        } else {
            None
        };

        // 部分容器不记录帧数，退化为统计视频流的数据包数量
        let frame_count = if reported_frames > 0 {
            reported_frames
        } else {
            let counted = ictx
                .packets()
                .filter(|(stream, _)| stream.index() == stream_index)
                .count();
            debug!("容器未记录帧数，按数据包统计: {}", counted);
            counted
        };

        Ok(Self {
            path,
            stream_index,
            frame_count,
            fps,
            duration,
            width,
            height,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn fps(&self) -> Option<f64> {
        self.fps
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// 取出解码器中所有已就绪的帧，把命中的位置转换为 RGB 图像
    fn drain_decoder(
        &self,
        decoder: &mut ffmpeg::decoder::Video,
        scaler: &mut Option<ffmpeg::software::scaling::Context>,
        position: &mut usize,
        wanted: &BTreeSet<usize>,
        time_base: ffmpeg::Rational,
        frames: &mut Vec<DecodedFrame>,
    ) -> Result<(), DetectError> {
        let mut decoded = ffmpeg::frame::Video::empty();

        while decoder.receive_frame(&mut decoded).is_ok() {
            let current = *position;
            *position += 1;

            if !wanted.contains(&current) {
                continue;
            }

            if scaler.is_none() {
                let ctx = ffmpeg::software::scaling::Context::get(
                    decoded.format(),
                    decoded.width(),
                    decoded.height(),
                    ffmpeg::format::Pixel::RGB24,
                    decoded.width(),
                    decoded.height(),
                    ffmpeg::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| DetectError::CorruptMedia(format!("无法创建缩放器: {}", e)))?;
                *scaler = Some(ctx);
            }

            let Some(active) = scaler.as_mut() else {
                continue;
            };

            let mut rgb_frame = ffmpeg::frame::Video::empty();
            if let Err(e) = active.run(&decoded, &mut rgb_frame) {
                warn!("帧 {} 颜色转换失败，跳过: {}", current, e);
                continue;
            }

            let timestamp = decoded
                .timestamp()
                .map(|ts| ts as f64 * f64::from(time_base))
                .or_else(|| self.fps.map(|fps| current as f64 / fps));

            match frame_to_image(&rgb_frame) {
                Some(image) => frames.push(DecodedFrame {
                    position: current,
                    timestamp,
                    image,
                }),
                None => warn!("帧 {} 数据不完整，跳过", current),
            }
        }

        Ok(())
    }
}

impl FrameSource for FfmpegFrameSource {
    fn total_frames(&self) -> usize {
        self.frame_count
    }

    /// 顺序解码，只转换需要的帧；读到最后一个目标帧后立即停止
    fn decode_at(&mut self, positions: &[usize]) -> Result<Vec<DecodedFrame>, DetectError> {
        let wanted: BTreeSet<usize> = positions.iter().copied().collect();
        let Some(&last) = wanted.iter().next_back() else {
            return Ok(Vec::new());
        };

        let mut ictx = open_input(&self.path)?;
        let (time_base, mut decoder) = {
            let stream = ictx
                .stream(self.stream_index)
                .ok_or_else(|| DetectError::CorruptMedia("视频流已不存在".to_string()))?;
            let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .and_then(|ctx| ctx.decoder().video())
                .map_err(|e| DetectError::CorruptMedia(format!("无法创建视频解码器: {}", e)))?;
            (stream.time_base(), decoder)
        };

        let mut scaler = None;
        let mut position = 0usize;
        let mut frames = Vec::with_capacity(wanted.len());

        for (stream, packet) in ictx.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                continue;
            }
            self.drain_decoder(
                &mut decoder,
                &mut scaler,
                &mut position,
                &wanted,
                time_base,
                &mut frames,
            )?;
            if position > last {
                break;
            }
        }

        if position <= last {
            // 冲刷解码器中缓存的尾帧
            if decoder.send_eof().is_ok() {
                self.drain_decoder(
                    &mut decoder,
                    &mut scaler,
                    &mut position,
                    &wanted,
                    time_base,
                    &mut frames,
                )?;
            }
        }

        debug!(
            "解码完成: 共读取 {} 帧，命中 {}/{} 个采样位置",
            position,
            frames.len(),
            wanted.len()
        );

        Ok(frames)
    }
}

/// 将 RGB24 帧转换为 DynamicImage（按行拷贝，跳过行尾填充）
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Option<DynamicImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width * 3;

    let mut buf = Vec::with_capacity(row_bytes * height);
    for y in 0..height {
        let start = y * stride;
        let row = data.get(start..start + row_bytes)?;
        buf.extend_from_slice(row);
    }

    image::RgbImage::from_raw(width as u32, height as u32, buf).map(DynamicImage::ImageRgb8)
}
