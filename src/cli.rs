// src/cli.rs

use clap::{Parser, ValueEnum};
use ffqm::config::{RunConfig, ScalingAlgorithm, SeekOffset};
use ffqm::metrics::MetricName;
use ffqm::vmaf::{parse_key_value, VmafFeature, VmafOptions};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Calculate video quality metrics with ffmpeg", long_about = None)]
pub struct CliArgs {
    /// Distorted video file
    #[arg(required = true)]
    pub distorted: PathBuf,

    /// Reference video file
    #[arg(required = true)]
    pub reference: PathBuf,

    /// Only print the ffmpeg command, do not compute anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Show debug output
    #[arg(short, long)]
    pub verbose: bool,

    /// Show a progress bar
    #[arg(short, long)]
    pub progress: bool,

    /// Keep temporary log files for debugging
    #[arg(short, long)]
    pub keep_tmp: bool,

    /// Directory for temporary log files (default: system temp dir)
    #[arg(long, value_name = "DIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Metrics to calculate
    #[arg(short, long, value_enum, num_args = 1.., default_values_t = [MetricName::Psnr, MetricName::Ssim])]
    pub metrics: Vec<MetricName>,

    /// Scaling algorithm used to bring the distorted video to the reference size
    #[arg(short, long, value_enum, default_value_t = ScalingAlgorithm::Bicubic)]
    pub scaling_algorithm: ScalingAlgorithm,

    /// Force an input frame rate for both videos
    #[arg(short = 'r', long)]
    pub framerate: Option<f64>,

    /// Delay the distorted video against the reference by this many seconds
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub dist_delay: f64,

    /// ffmpeg threads, 0 = auto
    #[arg(short, long, default_value_t = RunConfig::DEFAULT_THREADS)]
    pub threads: u32,

    /// Number of frames to calculate
    #[arg(long)]
    pub num_frames: Option<u64>,

    /// Seek both inputs before calculating, as HH:MM:SS.ms, seconds or frame:<n>
    #[arg(long, value_parser = parse_seek_offset)]
    pub start_offset: Option<SeekOffset>,

    /// Write results to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output_file: Option<PathBuf>,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
    pub output_format: OutputFormat,

    /// VMAF model file, or the name of a bundled model
    #[arg(long)]
    pub vmaf_model_path: Option<String>,

    /// Extra VMAF model parameters as key=value
    #[arg(long, num_args = 1.., value_parser = parse_model_param)]
    pub vmaf_model_params: Vec<(String, String)>,

    /// libvmaf threads, 0 = auto
    #[arg(long, default_value_t = VmafOptions::DEFAULT_THREADS)]
    pub vmaf_threads: u32,

    /// Compute VMAF on every n-th frame only
    #[arg(long, default_value_t = VmafOptions::DEFAULT_SUBSAMPLE, value_parser = clap::value_parser!(u32).range(1..))]
    pub vmaf_subsample: u32,

    /// Additional VMAF features, e.g. cambi or "psnr:enable_chroma=false"
    #[arg(long, num_args = 1.., value_parser = parse_feature)]
    pub vmaf_features: Vec<VmafFeature>,

    /// Write a PNG plot per metric into this directory
    #[arg(long, value_name = "DIR")]
    pub plot_dir: Option<PathBuf>,

    /// Enable logging to file (ffqm_YYYYMMDD_HHMMSS.log)
    #[arg(long)]
    pub log: bool,

    /// ffmpeg executable
    #[arg(long, value_name = "PATH", default_value = RunConfig::DEFAULT_ENGINE)]
    pub ffmpeg: PathBuf,
}

impl CliArgs {
    pub fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::new(&self.reference, &self.distorted);
        config.scaling_algorithm = self.scaling_algorithm;
        config.framerate = self.framerate;
        config.dist_delay = self.dist_delay;
        config.dry_run = self.dry_run;
        config.verbose = self.verbose;
        config.threads = self.threads;
        config.progress = self.progress;
        config.keep_tmp_files = self.keep_tmp;
        if let Some(dir) = &self.tmp_dir {
            config.tmp_dir = dir.clone();
        }
        config.num_frames = self.num_frames;
        config.start_offset = self.start_offset.clone();
        config.ffmpeg_path = self.ffmpeg.clone();
        config
    }

    /// VMAF options, when VMAF is requested.
    pub fn vmaf_options(&self) -> Option<VmafOptions> {
        if !self.metrics.contains(&MetricName::Vmaf) {
            return None;
        }
        Some(VmafOptions {
            model_path: self.vmaf_model_path.clone(),
            model_params: self.vmaf_model_params.clone(),
            n_threads: self.vmaf_threads,
            n_subsample: self.vmaf_subsample,
            features: self.vmaf_features.clone(),
        })
    }
}

fn parse_seek_offset(s: &str) -> Result<SeekOffset, String> {
    s.parse().map_err(|e: ffqm::QualityError| e.to_string())
}

fn parse_model_param(s: &str) -> Result<(String, String), String> {
    parse_key_value(s).map_err(|e| e.to_string())
}

fn parse_feature(s: &str) -> Result<VmafFeature, String> {
    s.parse().map_err(|e: ffqm::QualityError| e.to_string())
}

pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}
