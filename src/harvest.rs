// src/harvest.rs
//
// Reads per-frame values back after ffmpeg has exited. psnr, ssim and
// libvmaf write log files; vif and msad only print through a metadata
// stage, so their values are scraped from the console text.

use crate::artifacts::ArtifactSet;
use crate::error::{QualityError, Result};
use crate::metrics::{round3, FrameRecord, MetricData, MetricName, MetricSeries};
use log::{debug, info};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const METADATA_PREFIX: &str = "[Parsed_metadata";

/// Where the per-frame values of one metric come from.
pub trait ResultSource {
    fn metric(&self) -> MetricName;
    fn read(&self) -> Result<MetricSeries>;
}

/// A log file written by the metric filter.
pub struct ArtifactFile {
    metric: MetricName,
    path: PathBuf,
}

impl ResultSource for ArtifactFile {
    fn metric(&self) -> MetricName {
        self.metric
    }

    fn read(&self) -> Result<MetricSeries> {
        debug!("Reading {} log {}", self.metric, self.path.display());
        let content = fs::read_to_string(&self.path).map_err(|e| {
            QualityError::Parse(format!(
                "Could not read {} log {}: {}",
                self.metric,
                self.path.display(),
                e
            ))
        })?;
        match self.metric {
            MetricName::Psnr => parse_psnr_log(&content),
            MetricName::Ssim => parse_ssim_log(&content),
            MetricName::Vmaf => parse_vmaf_log(&content),
            other => Err(QualityError::Parse(format!("{} does not write a log file", other))),
        }
    }
}

/// Values printed to ffmpeg's stderr by `metadata=mode=print`.
pub struct ConsoleText<'a> {
    metric: MetricName,
    text: &'a str,
}

impl ResultSource for ConsoleText<'_> {
    fn metric(&self) -> MetricName {
        self.metric
    }

    fn read(&self) -> Result<MetricSeries> {
        Ok(parse_metadata_output(self.text, self.metric))
    }
}

pub fn source_for<'a>(
    metric: MetricName,
    console: &'a str,
    artifacts: &ArtifactSet,
) -> Result<Box<dyn ResultSource + 'a>> {
    if metric.reads_console() {
        return Ok(Box::new(ConsoleText { metric, text: console }));
    }
    let path = artifacts
        .path(metric.filter())
        .ok_or_else(|| QualityError::Parse(format!("No log file allocated for {}", metric)))?
        .to_path_buf();
    Ok(Box::new(ArtifactFile { metric, path }))
}

/// Collects the series of every requested metric.
pub fn harvest(console: &str, metrics: &[MetricName], artifacts: &ArtifactSet) -> Result<MetricData> {
    let mut data = MetricData::new();
    for &metric in metrics {
        let source = source_for(metric, console, artifacts)?;
        let series = source.read()?;
        check_keys(source.metric(), &series)?;
        info!("Read {} frames of {}", series.len(), metric);
        data.insert(metric, series);
    }
    Ok(data)
}

/// Every frame must carry the sub-metrics of the first one.
fn check_keys(metric: MetricName, series: &MetricSeries) -> Result<()> {
    let Some(first) = series.first() else {
        return Ok(());
    };
    let expected: Vec<&str> = first.keys().collect();
    for record in series {
        let mismatch = record.len() != expected.len() || expected.iter().any(|k| record.get(k).is_none());
        if mismatch {
            return Err(QualityError::Parse(format!(
                "{} frame {} has sub-metrics [{}], expected [{}]",
                metric,
                record.n,
                record.keys().collect::<Vec<_>>().join(", "),
                expected.join(", ")
            )));
        }
    }
    Ok(())
}

// --- Log file formats ---

/// `n:1 mse_avg:529.52 mse_y:887.00 ... psnr_y:18.65 psnr_u:24.45 psnr_v:21.43`
pub fn parse_psnr_log(content: &str) -> Result<MetricSeries> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| parse_key_value_line(line, |key| key.to_string()))
        .collect()
}

/// `n:1 Y:0.937213 U:0.961733 V:0.945788 All:0.948245 (12.860441)`
///
/// Keys get an `ssim_` prefix and `All` becomes `avg` to match PSNR naming.
pub fn parse_ssim_log(content: &str) -> Result<MetricSeries> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = line.split(" (").next().unwrap_or(line);
            parse_key_value_line(line, |key| {
                format!("ssim_{}", key.to_lowercase()).replace("all", "avg")
            })
        })
        .collect()
}

fn parse_key_value_line(line: &str, rename: impl Fn(&str) -> String) -> Result<FrameRecord> {
    let mut record: Option<FrameRecord> = None;
    let mut values: Vec<(String, f64)> = Vec::new();

    for field in line.split_whitespace() {
        let (key, value) = field
            .split_once(':')
            .ok_or_else(|| QualityError::Parse(format!("Malformed field '{}' in line '{}'", field, line)))?;
        if key == "n" {
            let n = value
                .parse::<u64>()
                .map_err(|_| QualityError::Parse(format!("Invalid frame number '{}'", value)))?;
            record = Some(FrameRecord::new(n));
        } else {
            let v = value
                .parse::<f64>()
                .map_err(|_| QualityError::Parse(format!("Invalid value '{}' for {}", value, key)))?;
            values.push((rename(key), round3(v)));
        }
    }

    let mut record =
        record.ok_or_else(|| QualityError::Parse(format!("Missing frame number in line '{}'", line)))?;
    for (key, value) in values {
        record.insert(key, value);
    }
    Ok(record)
}

#[derive(Deserialize)]
struct VmafLog {
    frames: Vec<VmafFrame>,
}

#[derive(Deserialize)]
struct VmafFrame {
    #[serde(rename = "frameNum")]
    frame_num: u64,
    metrics: FrameRecord,
}

/// libvmaf JSON log. Frame numbers are 0-based there and shifted by one.
pub fn parse_vmaf_log(content: &str) -> Result<MetricSeries> {
    let log: VmafLog = serde_json::from_str(content)
        .map_err(|e| QualityError::Parse(format!("Invalid VMAF log: {}", e)))?;
    Ok(log
        .frames
        .into_iter()
        .map(|frame| {
            let mut record = frame.metrics;
            record.n = frame.frame_num + 1;
            record
        })
        .collect())
}

// --- Console output ---

/// Scrapes `metadata=mode=print` output for one metric:
///
/// ```text
/// [Parsed_metadata_4 @ 0x7f995cd08640] frame:1    pts:1       pts_time:0.0401x
/// [Parsed_metadata_4 @ 0x7f995cd08640] lavfi.vif.scale.0=0.263582
/// ```
///
/// Frame numbers are kept as printed (0-based). Each metadata stage is
/// tracked by its log prefix so several printing metrics do not mix; frames
/// without any value of `metric` are dropped.
pub fn parse_metadata_output(text: &str, metric: MetricName) -> MetricSeries {
    let key_prefix = format!("lavfi.{}.", metric);
    let mut series = MetricSeries::new();
    let mut pending: Vec<(String, FrameRecord)> = Vec::new();

    for line in text.lines().map(str::trim) {
        if !line.starts_with(METADATA_PREFIX) {
            continue;
        }
        let Some((label, rest)) = line.split_once(']') else {
            continue;
        };
        let Some(token) = rest.split_whitespace().next() else {
            continue;
        };

        if let Some(frame) = token.strip_prefix("frame:") {
            let Ok(n) = frame.parse::<u64>() else {
                continue;
            };
            let slot = pending.iter().position(|(l, _)| l == label);
            let previous = match slot {
                Some(i) => Some(std::mem::replace(&mut pending[i].1, FrameRecord::new(n))),
                None => {
                    pending.push((label.to_string(), FrameRecord::new(n)));
                    None
                }
            };
            if let Some(record) = previous.filter(|r| !r.is_empty()) {
                series.push(record);
            }
            continue;
        }

        let Some(entry) = token.strip_prefix(&key_prefix) else {
            continue;
        };
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        // No frame seen yet for this stage
        if let Some((_, record)) = pending.iter_mut().find(|(l, _)| l == label) {
            record.insert(key.replace('.', "_").to_lowercase(), round3(value));
        }
    }

    series.extend(pending.into_iter().map(|(_, r)| r).filter(|r| !r.is_empty()));
    series
}
