use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::DetectError;
use crate::video_decoder::FfmpegFrameSource;

/// 支持的图片扩展名
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "gif"];
/// 支持的视频扩展名
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "wmv", "webm"];

/// 发送给分析服务前的最大尺寸，超出时等比缩小
pub const MAX_UPLOAD_DIMENSIONS: (u32, u32) = (1920, 1080);

/// 图片内容签名白名单（按实际内容判断，而不是扩展名）
const IMAGE_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Gif,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

/// 一个可分析单元：一张图片，或视频中的一帧
#[derive(Debug, Clone)]
pub struct MediaUnit {
    /// 图片为 0；视频为帧序号
    pub index: usize,
    /// 帧在视频中的时间（秒），仅视频有
    pub timestamp: Option<f64>,
    pub image: DynamicImage,
}

impl MediaUnit {
    pub fn still(image: DynamicImage) -> Self {
        Self {
            index: 0,
            timestamp: None,
            image,
        }
    }

    pub fn frame(index: usize, timestamp: Option<f64>, image: DynamicImage) -> Self {
        Self {
            index,
            timestamp,
            image,
        }
    }

    /// 编码为 JPEG，用于发送给分析服务；超过 1920x1080 的图先等比缩小
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, DetectError> {
        let (max_width, max_height) = MAX_UPLOAD_DIMENSIONS;
        let rgb = if self.image.width() > max_width || self.image.height() > max_height {
            debug!(
                "单元 {} 尺寸 {}x{} 超出上限，缩小后发送",
                self.index,
                self.image.width(),
                self.image.height()
            );
            DynamicImage::ImageRgb8(self.image.thumbnail(max_width, max_height).to_rgb8())
        } else {
            DynamicImage::ImageRgb8(self.image.to_rgb8())
        };
        let mut buf = Cursor::new(Vec::new());
        rgb.write_to(&mut buf, image::ImageOutputFormat::Jpeg(quality))
            .map_err(|e| DetectError::Internal(format!("JPEG 编码失败: {}", e)))?;
        Ok(buf.into_inner())
    }
}

/// 媒体基本信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub kind: MediaKind,
    /// 格式（扩展名或图片编码名）
    pub format: String,
    pub width: u32,
    pub height: u32,
    /// 文件大小（字节）
    pub file_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    /// 视频时长（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// 校验通过的媒体
pub enum ValidatedMedia {
    Image {
        unit: MediaUnit,
        info: MediaInfo,
    },
    /// 视频需要落盘后交给 FFmpeg 解码，`scratch` 在 drop 时删除临时文件
    Video {
        source: FfmpegFrameSource,
        scratch: ScratchFile,
        info: MediaInfo,
    },
}

impl ValidatedMedia {
    pub fn info(&self) -> &MediaInfo {
        match self {
            Self::Image { info, .. } | Self::Video { info, .. } => info,
        }
    }
}

/// 请求级别的临时文件
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn create(extension: &str, bytes: &[u8]) -> Result<Self, DetectError> {
        let dir = std::env::temp_dir().join("deepfake-detect");
        std::fs::create_dir_all(&dir)
            .map_err(|e| DetectError::Internal(format!("创建临时目录失败: {}", e)))?;
        let path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), extension));
        std::fs::write(&path, bytes)
            .map_err(|e| DetectError::Internal(format!("写入临时文件失败: {}", e)))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("清理临时文件失败: {} - {}", self.path.display(), e);
        }
    }
}

/// 从声明的类型中解析扩展名
///
/// 支持文件名（`clip.MP4`）、裸扩展名（`png`）和 MIME 类型（`image/jpeg`）
pub fn resolve_extension(declared_type: &str) -> Option<String> {
    let declared = declared_type.trim().to_ascii_lowercase();
    if declared.is_empty() {
        return None;
    }

    if let Some((_, subtype)) = declared.split_once('/') {
        let ext = match subtype {
            "jpeg" | "jpg" | "pjpeg" => "jpg",
            "png" => "png",
            "webp" => "webp",
            "bmp" | "x-ms-bmp" => "bmp",
            "gif" => "gif",
            "mp4" => "mp4",
            "x-msvideo" | "avi" => "avi",
            "quicktime" => "mov",
            "x-matroska" => "mkv",
            "x-flv" => "flv",
            "x-ms-wmv" => "wmv",
            "webm" => "webm",
            other => other,
        };
        return Some(ext.to_string());
    }

    match declared.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => Some(ext.to_string()),
        Some(_) => None,
        None => Some(declared),
    }
}

/// 根据声明类型判断媒体类别
pub fn classify(declared_type: &str) -> Result<(MediaKind, String), DetectError> {
    let ext = resolve_extension(declared_type)
        .ok_or_else(|| DetectError::UnsupportedFormat(format!("无法识别的类型: {:?}", declared_type)))?;

    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Ok((MediaKind::Image, ext))
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Ok((MediaKind::Video, ext))
    } else {
        Err(DetectError::UnsupportedFormat(ext))
    }
}

/// 校验并解码上传的媒体文件
///
/// 只做格式检查和解码，不调用任何外部服务。视频会写入临时文件并用 FFmpeg 探测。
pub fn validate(file_bytes: Vec<u8>, declared_type: &str) -> Result<ValidatedMedia, DetectError> {
    let (kind, ext) = classify(declared_type)?;

    if file_bytes.is_empty() {
        return Err(DetectError::CorruptMedia("文件为空".to_string()));
    }

    match kind {
        MediaKind::Image => validate_image(&file_bytes, &ext),
        MediaKind::Video => validate_video(&file_bytes, &ext),
    }
}

fn validate_image(bytes: &[u8], ext: &str) -> Result<ValidatedMedia, DetectError> {
    let format = image::guess_format(bytes)
        .map_err(|e| DetectError::CorruptMedia(format!("无法识别图片内容: {}", e)))?;

    if !IMAGE_FORMATS.contains(&format) {
        return Err(DetectError::UnsupportedFormat(format!("{:?}", format)));
    }

    let declared_matches = format.extensions_str().contains(&ext);
    if !declared_matches {
        debug!("图片扩展名与内容不一致: 声明 {}，实际 {:?}", ext, format);
    }

    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| DetectError::CorruptMedia(format!("图片解码失败: {}", e)))?;

    let info = MediaInfo {
        kind: MediaKind::Image,
        format: format!("{:?}", format).to_lowercase(),
        width: image.width(),
        height: image.height(),
        file_size: bytes.len(),
        frame_count: None,
        fps: None,
        duration: None,
    };

    Ok(ValidatedMedia::Image {
        unit: MediaUnit::still(image),
        info,
    })
}

fn validate_video(bytes: &[u8], ext: &str) -> Result<ValidatedMedia, DetectError> {
    let scratch = ScratchFile::create(ext, bytes)?;
    let source = FfmpegFrameSource::open(scratch.path())?;

    let info = MediaInfo {
        kind: MediaKind::Video,
        format: ext.to_string(),
        width: source.width(),
        height: source.height(),
        file_size: bytes.len(),
        frame_count: Some(source.frame_count()),
        fps: source.fps(),
        duration: source.duration(),
    };

    Ok(ValidatedMedia::Video {
        source,
        scratch,
        info,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    pub(crate) fn encoded_image(format: ImageOutputFormatKind) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(32, 24, |x, y| {
            Rgb([(x * 8) as u8, (y * 10) as u8, 128u8])
        }));
        let mut buf = Cursor::new(Vec::new());
        let output = match format {
            ImageOutputFormatKind::Png => image::ImageOutputFormat::Png,
            ImageOutputFormatKind::Jpeg => image::ImageOutputFormat::Jpeg(90),
            ImageOutputFormatKind::Tiff => image::ImageOutputFormat::Tiff,
        };
        img.write_to(&mut buf, output).unwrap();
        buf.into_inner()
    }

    pub(crate) enum ImageOutputFormatKind {
        Png,
        Jpeg,
        Tiff,
    }

    #[test]
    fn test_resolve_extension() {
        assert_eq!(resolve_extension("Clip.MP4").as_deref(), Some("mp4"));
        assert_eq!(resolve_extension("png").as_deref(), Some("png"));
        assert_eq!(resolve_extension("image/jpeg").as_deref(), Some("jpg"));
        assert_eq!(resolve_extension("video/quicktime").as_deref(), Some("mov"));
        assert_eq!(resolve_extension("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(resolve_extension("   "), None);
        assert_eq!(resolve_extension("trailing."), None);
    }

    #[test]
    fn test_text_file_is_unsupported() {
        let result = validate(b"hello".to_vec(), "notes.txt");
        assert!(matches!(result, Err(DetectError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_valid_png_decodes_to_single_unit() {
        let bytes = encoded_image(ImageOutputFormatKind::Png);
        let size = bytes.len();
        match validate(bytes, "face.png").unwrap() {
            ValidatedMedia::Image { unit, info } => {
                assert_eq!(unit.index, 0);
                assert!(unit.timestamp.is_none());
                assert_eq!(info.kind, MediaKind::Image);
                assert_eq!((info.width, info.height), (32, 24));
                assert_eq!(info.file_size, size);
            }
            ValidatedMedia::Video { .. } => panic!("expected an image"),
        }
    }

    #[test]
    fn test_content_wins_over_declared_extension() {
        let bytes = encoded_image(ImageOutputFormatKind::Jpeg);
        let validated = validate(bytes, "image/png").unwrap();
        assert_eq!(validated.info().format, "jpeg");
    }

    #[test]
    fn test_garbage_image_is_corrupt() {
        let result = validate(vec![0u8, 1, 2, 3, 4, 5, 6, 7], "photo.jpg");
        assert!(matches!(result, Err(DetectError::CorruptMedia(_))));
    }

    #[test]
    fn test_truncated_png_is_corrupt() {
        let mut bytes = encoded_image(ImageOutputFormatKind::Png);
        bytes.truncate(40);
        let result = validate(bytes, "photo.png");
        assert!(matches!(result, Err(DetectError::CorruptMedia(_))));
    }

    #[test]
    fn test_tiff_content_is_unsupported() {
        let bytes = encoded_image(ImageOutputFormatKind::Tiff);
        let result = validate(bytes, "scan.png");
        assert!(matches!(result, Err(DetectError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_valid_video_reports_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        crate::video_decoder::tests::write_clip(&path, 12, 32, 16, 12).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let size = bytes.len();

        match validate(bytes, "video/x-msvideo").unwrap() {
            ValidatedMedia::Video { scratch, info, .. } => {
                assert!(scratch.path().exists());
                assert_eq!(info.format, "avi");
                assert_eq!((info.width, info.height), (32, 16));
                assert_eq!(info.frame_count, Some(12));
                assert_eq!(info.file_size, size);

                let scratch_path = scratch.path().to_path_buf();
                drop(scratch);
                assert!(!scratch_path.exists());
            }
            ValidatedMedia::Image { .. } => panic!("expected a video"),
        }
    }

    #[test]
    fn test_empty_payload_is_corrupt() {
        let result = validate(Vec::new(), "clip.mp4");
        assert!(matches!(result, Err(DetectError::CorruptMedia(_))));
    }

    #[test]
    fn test_unit_encodes_to_jpeg() {
        let bytes = encoded_image(ImageOutputFormatKind::Png);
        let img = image::load_from_memory(&bytes).unwrap();
        let jpeg = MediaUnit::still(img).to_jpeg(85).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn test_oversized_unit_is_downscaled_before_encoding() {
        let wide = DynamicImage::new_rgb8(3840, 200);
        let jpeg = MediaUnit::frame(7, Some(0.28), wide).to_jpeg(85).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1920, 100));

        let tall = DynamicImage::new_rgb8(1000, 2160);
        let jpeg = MediaUnit::still(tall).to_jpeg(85).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (500, 1080));
    }
}
