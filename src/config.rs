// src/config.rs

use crate::error::{QualityError, Result};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Scaler flags accepted by ffmpeg's `scale` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum ScalingAlgorithm {
    FastBilinear,
    Bilinear,
    #[default]
    Bicubic,
    Experimental,
    Neighbor,
    Area,
    Bicublin,
    Gauss,
    Sinc,
    Lanczos,
    Spline,
}

impl ScalingAlgorithm {
    pub const ALL: [ScalingAlgorithm; 11] = [
        ScalingAlgorithm::FastBilinear,
        ScalingAlgorithm::Bilinear,
        ScalingAlgorithm::Bicubic,
        ScalingAlgorithm::Experimental,
        ScalingAlgorithm::Neighbor,
        ScalingAlgorithm::Area,
        ScalingAlgorithm::Bicublin,
        ScalingAlgorithm::Gauss,
        ScalingAlgorithm::Sinc,
        ScalingAlgorithm::Lanczos,
        ScalingAlgorithm::Spline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingAlgorithm::FastBilinear => "fast_bilinear",
            ScalingAlgorithm::Bilinear => "bilinear",
            ScalingAlgorithm::Bicubic => "bicubic",
            ScalingAlgorithm::Experimental => "experimental",
            ScalingAlgorithm::Neighbor => "neighbor",
            ScalingAlgorithm::Area => "area",
            ScalingAlgorithm::Bicublin => "bicublin",
            ScalingAlgorithm::Gauss => "gauss",
            ScalingAlgorithm::Sinc => "sinc",
            ScalingAlgorithm::Lanczos => "lanczos",
            ScalingAlgorithm::Spline => "spline",
        }
    }
}

impl fmt::Display for ScalingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScalingAlgorithm {
    type Err = QualityError;

    fn from_str(s: &str) -> Result<Self> {
        ScalingAlgorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<&str> = ScalingAlgorithm::ALL.iter().map(|a| a.as_str()).collect();
                QualityError::Config(format!(
                    "Unknown scaling algorithm '{}', allowed: {}",
                    s,
                    allowed.join(", ")
                ))
            })
    }
}

static CLOCK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<h>\d+):)?(?P<m>\d{1,2}):(?P<s>\d{1,2}(?:\.\d+)?)$")
        .expect("Invalid clock Regex")
});

/// Where to start computing metrics in both inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum SeekOffset {
    /// Seconds from the start, parsed from `HH:MM:SS[.f]`, `MM:SS[.f]` or `S[.f]`.
    Time(f64),
    /// Frame number, converted with the reference frame rate before invoking ffmpeg.
    Frame(u64),
}

impl SeekOffset {
    /// Offset in seconds for a stream running at `framerate`.
    pub fn to_seconds(&self, framerate: f64) -> f64 {
        match self {
            SeekOffset::Time(secs) => *secs,
            SeekOffset::Frame(n) => *n as f64 / framerate,
        }
    }
}

impl FromStr for SeekOffset {
    type Err = QualityError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(frame) = s.strip_prefix("frame:") {
            return frame
                .parse::<u64>()
                .map(SeekOffset::Frame)
                .map_err(|_| QualityError::Config(format!("Invalid frame offset '{}'", s)));
        }
        if let Some(caps) = CLOCK_REGEX.captures(s) {
            let part = |name: &str| -> f64 {
                caps.name(name)
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            return Ok(SeekOffset::Time(part("h") * 3600.0 + part("m") * 60.0 + part("s")));
        }
        match s.parse::<f64>() {
            Ok(secs) if secs >= 0.0 && secs.is_finite() => Ok(SeekOffset::Time(secs)),
            _ => Err(QualityError::Config(format!(
                "Invalid start offset '{}', use HH:MM:SS.ms, seconds or frame:<n>",
                s
            ))),
        }
    }
}

/// Everything one comparison run needs. Immutable once validated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub reference: PathBuf,
    pub distorted: PathBuf,
    pub scaling_algorithm: ScalingAlgorithm,
    pub framerate: Option<f64>,
    /// Seconds the distorted input is delayed against the reference.
    pub dist_delay: f64,
    pub dry_run: bool,
    pub verbose: bool,
    /// ffmpeg `-threads`, 0 lets ffmpeg decide.
    pub threads: u32,
    pub progress: bool,
    pub keep_tmp_files: bool,
    pub tmp_dir: PathBuf,
    pub num_frames: Option<u64>,
    pub start_offset: Option<SeekOffset>,
    pub ffmpeg_path: PathBuf,
    /// Directory holding VMAF models shipped alongside the binary.
    pub vmaf_model_dir: PathBuf,
}

impl RunConfig {
    pub const DEFAULT_THREADS: u32 = 0;
    pub const DEFAULT_ENGINE: &'static str = "ffmpeg";

    /// Config with defaults for everything but the two inputs.
    pub fn new(reference: impl Into<PathBuf>, distorted: impl Into<PathBuf>) -> Self {
        RunConfig {
            reference: reference.into(),
            distorted: distorted.into(),
            scaling_algorithm: ScalingAlgorithm::default(),
            framerate: None,
            dist_delay: 0.0,
            dry_run: false,
            verbose: false,
            threads: Self::DEFAULT_THREADS,
            progress: false,
            keep_tmp_files: false,
            tmp_dir: std::env::temp_dir(),
            num_frames: None,
            start_offset: None,
            ffmpeg_path: PathBuf::from(Self::DEFAULT_ENGINE),
            vmaf_model_dir: default_vmaf_model_dir(),
        }
    }

    /// Checks inputs and prepares the working directory.
    pub fn validate(&self) -> Result<()> {
        check_input(&self.reference, "Reference")?;
        check_input(&self.distorted, "Distorted")?;

        if self.reference == self.distorted {
            warn!(
                "Reference and distorted files are the same! This may lead to unexpected results or numerical issues."
            );
        }

        if let Some(fps) = self.framerate {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(QualityError::Config(format!("Invalid framerate {}", fps)));
            }
        }
        if !self.dist_delay.is_finite() {
            return Err(QualityError::Config(format!("Invalid distorted delay {}", self.dist_delay)));
        }
        if self.num_frames == Some(0) {
            return Err(QualityError::Config("Number of frames must be at least 1".to_string()));
        }

        if !self.tmp_dir.is_dir() {
            debug!("Creating temporary directory: {}", self.tmp_dir.display());
            std::fs::create_dir_all(&self.tmp_dir)?;
        }
        Ok(())
    }
}

fn check_input(path: &Path, role: &str) -> Result<()> {
    if !path.is_file() {
        return Err(QualityError::Config(format!(
            "{} file not found: {}",
            role,
            path.display()
        )));
    }
    let is_yuv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yuv"));
    if is_yuv {
        return Err(QualityError::Config(format!(
            "YUV files are not supported ({}), please convert to a format that ffmpeg can read natively, such as Y4M or FFV1.",
            path.display()
        )));
    }
    Ok(())
}

/// `vmaf_models` next to the executable, falling back to the working directory.
pub fn default_vmaf_model_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("vmaf_models")))
        .unwrap_or_else(|| PathBuf::from("vmaf_models"))
}
