// src/stats.rs
//
// Aggregation of harvested series: per sub-metric summary statistics, the
// frame-joined table and the nested JSON document.

use crate::error::{QualityError, Result};
use crate::metrics::{deserialize_value, round3, serialize_value, FrameRecord, MetricData, MetricName, MetricSeries};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Descriptive statistics of one sub-metric over a whole series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    #[serde(serialize_with = "serialize_value", deserialize_with = "deserialize_value")]
    pub average: f64,
    #[serde(serialize_with = "serialize_value", deserialize_with = "deserialize_value")]
    pub median: f64,
    #[serde(serialize_with = "serialize_value", deserialize_with = "deserialize_value")]
    pub stdev: f64,
    #[serde(serialize_with = "serialize_value", deserialize_with = "deserialize_value")]
    pub min: f64,
    #[serde(serialize_with = "serialize_value", deserialize_with = "deserialize_value")]
    pub max: f64,
}

impl StatsSummary {
    /// Summarizes `values`, which must not be empty.
    ///
    /// `average`, `median`, `min` and `max` see every value, so a single
    /// infinite PSNR frame makes the average infinite. `stdev` is the
    /// population standard deviation of the finite values only, 0 when fewer
    /// than two are finite.
    pub fn from_values(values: &[f64]) -> Option<StatsSummary> {
        if values.is_empty() {
            return None;
        }
        let count = values.len() as f64;
        let average = values.iter().sum::<f64>() / count;

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let stdev = if finite.len() > 1 {
            let mean = finite.iter().sum::<f64>() / finite.len() as f64;
            let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / finite.len() as f64;
            variance.sqrt()
        } else {
            0.0
        };

        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(StatsSummary {
            average: round3(average),
            median: round3(median),
            stdev: round3(stdev),
            min: round3(min),
            max: round3(max),
        })
    }
}

/// Summaries keyed by metric, then by sub-metric.
pub type GlobalStats = BTreeMap<MetricName, BTreeMap<String, StatsSummary>>;

/// Computes statistics for every metric with at least one frame. Sub-metric
/// keys are taken from the first frame.
pub fn global_stats(data: &MetricData) -> GlobalStats {
    let mut stats = GlobalStats::new();
    for (metric, series) in data {
        let Some(first) = series.first() else {
            continue;
        };
        debug!("Aggregating stats for {}", metric);
        let per_key: BTreeMap<String, StatsSummary> = first
            .keys()
            .filter_map(|key| {
                let values: Vec<f64> = series.iter().filter_map(|frame| frame.get(key)).collect();
                StatsSummary::from_values(&values).map(|s| (key.to_string(), s))
            })
            .collect();
        stats.insert(*metric, per_key);
    }
    stats
}

// --- Tabular output ---

/// Frame-joined rows of all metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    /// Sub-metric columns, excluding `n` and the input file columns.
    pub columns: Vec<String>,
    pub rows: Vec<(u64, Vec<f64>)>,
}

/// Joins all non-empty series on their frame index.
///
/// Only frames present in every series are kept. Columns follow metric
/// order, then the sub-metric order of each series' first frame; a
/// sub-metric name reported by two metrics is prefixed with the metric name.
pub fn to_rows(data: &MetricData) -> Result<ResultTable> {
    let series: Vec<(&MetricName, &MetricSeries)> = data.iter().filter(|(_, s)| !s.is_empty()).collect();
    if series.is_empty() {
        return Err(QualityError::NoData);
    }

    let mut columns: Vec<String> = Vec::new();
    let mut sources: Vec<(usize, String)> = Vec::new();
    for (i, (metric, frames)) in series.iter().enumerate() {
        for key in frames[0].keys() {
            let column = if columns.iter().any(|c| c == key) {
                format!("{}_{}", metric, key)
            } else {
                key.to_string()
            };
            columns.push(column);
            sources.push((i, key.to_string()));
        }
    }

    let lengths: Vec<usize> = series.iter().map(|(_, s)| s.len()).collect();
    if lengths.iter().any(|l| *l != lengths[0]) {
        warn!(
            "Metrics produced different numbers of frames ({}), keeping only frames present in all of them",
            series
                .iter()
                .map(|(m, s)| format!("{}: {}", m, s.len()))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let indexed: Vec<BTreeMap<u64, &FrameRecord>> = series
        .iter()
        .map(|(_, frames)| frames.iter().map(|f| (f.n, f)).collect())
        .collect();

    let rows = indexed[0]
        .keys()
        .filter(|n| indexed.iter().all(|frames| frames.contains_key(*n)))
        .map(|n| {
            let values = sources
                .iter()
                .map(|(i, key)| indexed[*i][n].get(key).unwrap_or(f64::NAN))
                .collect();
            (*n, values)
        })
        .collect();

    Ok(ResultTable { columns, rows })
}

/// Renders the joined table as CSV with the input paths as trailing columns.
pub fn to_csv(data: &MetricData, reference: &Path, distorted: &Path) -> Result<String> {
    let table = to_rows(data)?;
    let dist = distorted.to_string_lossy();
    let reference = reference.to_string_lossy();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["n".to_string()];
    header.extend(table.columns.iter().cloned());
    header.extend(["input_file_dist".to_string(), "input_file_ref".to_string()]);
    writer.write_record(&header)?;

    for (n, values) in &table.rows {
        let mut record = vec![n.to_string()];
        record.extend(values.iter().map(|v| format_value(*v)));
        record.extend([dist.to_string(), reference.to_string()]);
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| QualityError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| QualityError::Parse(format!("CSV output is not UTF-8: {}", e)))
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        value.to_string()
    }
}

// --- JSON output ---

/// The nested result document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    #[serde(flatten)]
    pub metrics: MetricData,
    pub global: GlobalStats,
    pub input_file_dist: String,
    pub input_file_ref: String,
}

impl ResultDocument {
    /// Builds the document from harvested data. Empty series are left out.
    pub fn new(data: &MetricData, reference: &Path, distorted: &Path) -> Self {
        let metrics: MetricData = data
            .iter()
            .filter(|(_, series)| !series.is_empty())
            .map(|(metric, series)| (*metric, series.clone()))
            .collect();
        ResultDocument {
            global: global_stats(&metrics),
            metrics,
            input_file_dist: distorted.to_string_lossy().into_owned(),
            input_file_ref: reference.to_string_lossy().into_owned(),
        }
    }

    /// Pretty-printed with four-space indentation.
    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        String::from_utf8(out).map_err(|e| QualityError::Parse(format!("JSON output is not UTF-8: {}", e)))
    }

    pub fn from_json(text: &str) -> Result<ResultDocument> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64, values: &[(&str, f64)]) -> FrameRecord {
        let mut record = FrameRecord::new(n);
        for (k, v) in values {
            record.insert(*k, *v);
        }
        record
    }

    #[test]
    fn summarizes_three_values() {
        let s = StatsSummary::from_values(&[1.0, 2.0, 4.0]).unwrap();
        assert_eq!(s.average, 2.333);
        assert_eq!(s.median, 2.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        // sqrt(((1-7/3)^2 + (2-7/3)^2 + (4-7/3)^2) / 3)
        assert_eq!(s.stdev, 1.247);
    }

    #[test]
    fn even_median_averages_middle_values() {
        let s = StatsSummary::from_values(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(s.median, 2.5);
        assert!(StatsSummary::from_values(&[]).is_none());
    }

    #[test]
    fn stdev_ignores_infinite_values() {
        let s = StatsSummary::from_values(&[30.0, f64::INFINITY]).unwrap();
        assert!(s.average.is_infinite());
        assert!(s.max.is_infinite());
        assert_eq!(s.min, 30.0);
        assert_eq!(s.stdev, 0.0);
    }

    #[test]
    fn global_stats_cover_first_frame_keys() {
        let mut data = MetricData::new();
        data.insert(
            MetricName::Ssim,
            vec![
                frame(1, &[("ssim_y", 0.9), ("ssim_avg", 0.8)]),
                frame(2, &[("ssim_y", 0.7), ("ssim_avg", 0.6)]),
            ],
        );
        data.insert(MetricName::Psnr, Vec::new());

        let stats = global_stats(&data);
        assert!(!stats.contains_key(&MetricName::Psnr));
        let ssim = &stats[&MetricName::Ssim];
        assert_eq!(ssim.keys().collect::<Vec<_>>(), vec!["ssim_avg", "ssim_y"]);
        assert_eq!(ssim["ssim_y"].average, 0.8);
    }

    #[test]
    fn rows_are_inner_joined_on_frame_index() {
        let mut data = MetricData::new();
        data.insert(
            MetricName::Psnr,
            vec![frame(1, &[("psnr_avg", 30.0)]), frame(2, &[("psnr_avg", 31.0)]), frame(3, &[("psnr_avg", 32.0)])],
        );
        data.insert(
            MetricName::Vif,
            vec![frame(0, &[("scale_0", 0.5)]), frame(1, &[("scale_0", 0.6)]), frame(2, &[("scale_0", 0.7)])],
        );

        let table = to_rows(&data).unwrap();
        assert_eq!(table.columns, vec!["psnr_avg", "scale_0"]);
        assert_eq!(table.rows, vec![(1, vec![30.0, 0.6]), (2, vec![31.0, 0.7])]);
    }

    #[test]
    fn csv_has_input_columns_last() {
        let mut data = MetricData::new();
        data.insert(MetricName::Ssim, vec![frame(1, &[("ssim_y", 0.937), ("ssim_avg", 0.948)])]);
        let csv = to_csv(&data, Path::new("ref.mkv"), Path::new("dist.mkv")).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("n,ssim_y,ssim_avg,input_file_dist,input_file_ref"));
        assert_eq!(lines.next(), Some("1,0.937,0.948,dist.mkv,ref.mkv"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn empty_data_has_no_rows() {
        assert!(matches!(to_rows(&MetricData::new()), Err(QualityError::NoData)));
    }

    #[test]
    fn document_round_trips_through_json() {
        let mut data = MetricData::new();
        data.insert(
            MetricName::Psnr,
            vec![
                frame(1, &[("mse_avg", 0.0), ("psnr_avg", f64::INFINITY)]),
                frame(2, &[("mse_avg", 3.5), ("psnr_avg", 42.687)]),
            ],
        );
        let doc = ResultDocument::new(&data, Path::new("ref.mkv"), Path::new("dist.mkv"));
        let json = doc.to_json().unwrap();
        assert!(json.contains("\"global\""));
        assert!(json.contains("\"input_file_ref\": \"ref.mkv\""));

        let back = ResultDocument::from_json(&json).unwrap();
        assert_eq!(back.metrics, doc.metrics);
        assert_eq!(back.global, doc.global);
        assert_eq!(back.input_file_dist, "dist.mkv");
    }
}
