// src/lib.rs
//
// Computes PSNR, SSIM, VMAF, VIF and MSAD between a reference and a
// distorted video by driving ffmpeg.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod graph;
pub mod harvest;
pub mod metrics;
pub mod plot;
pub mod quality;
pub mod stats;
pub mod vmaf;

pub use config::{RunConfig, ScalingAlgorithm, SeekOffset};
pub use error::{QualityError, Result};
pub use ffmpeg::{EngineOutput, EngineRunner};
pub use metrics::{FrameRecord, MetricData, MetricName, MetricSeries};
pub use quality::QualityMetrics;
pub use stats::{GlobalStats, ResultDocument, StatsSummary};
pub use vmaf::{VmafFeature, VmafOptions};
