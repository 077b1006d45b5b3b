pub mod aggregator;
pub mod analysis;
pub mod config;
pub mod error;
pub mod handler;
pub mod media;
pub mod orchestrator;
pub mod response;
pub mod sampler;
pub mod video_decoder;

pub use aggregator::{AggregatePolicy, AggregateReport, Aggregator, TemporalConsistency};
pub use analysis::{Classifier, GeminiClassifier, UnitVerdict};
pub use config::{CliOverrides, ConfigLoader, DetectConfig};
pub use error::{DetectError, ErrorKind};
pub use media::{validate, MediaInfo, MediaKind, MediaUnit, ValidatedMedia};
pub use orchestrator::{DetectionRequest, Detector, RequestState, Stage};
pub use response::{render_summary, DetectResponse, DetectResult};
pub use sampler::{FrameSampler, FrameSource};
