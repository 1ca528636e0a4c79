// src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QualityError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Metric '{metric}' is not supported by this ffmpeg build (missing filter '{filter}')")]
    UnsupportedMetric { metric: String, filter: String },

    #[error("ffmpeg command failed: {command}\n{diagnostic}")]
    Engine { command: String, diagnostic: String },

    #[error("Could not determine frame rate of {0}")]
    FrameRate(String),

    #[error("Failed to parse metric output: {0}")]
    Parse(String),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV processing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Plotting error: {0}")]
    Plot(String),

    #[error("No data calculated")]
    NoData,
}

impl QualityError {
    /// True for errors raised while validating inputs, before ffmpeg runs
    /// the metric computation.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            QualityError::Config(_) | QualityError::UnsupportedMetric { .. }
        )
    }
}

// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, QualityError>;
