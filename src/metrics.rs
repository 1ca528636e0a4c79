// src/metrics.rs

use crate::error::{QualityError, Result};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// --- Names ---

/// A video quality metric that can be requested from the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum MetricName {
    Psnr,
    Ssim,
    Vmaf,
    Vif,
    Msad,
}

impl MetricName {
    pub const ALL: [MetricName; 5] = [
        MetricName::Psnr,
        MetricName::Ssim,
        MetricName::Vmaf,
        MetricName::Vif,
        MetricName::Msad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Psnr => "psnr",
            MetricName::Ssim => "ssim",
            MetricName::Vmaf => "vmaf",
            MetricName::Vif => "vif",
            MetricName::Msad => "msad",
        }
    }

    /// The ffmpeg filter computing this metric.
    pub fn filter(&self) -> FilterName {
        match self {
            MetricName::Psnr => FilterName::Psnr,
            MetricName::Ssim => FilterName::Ssim,
            MetricName::Vmaf => FilterName::Libvmaf,
            MetricName::Vif => FilterName::Vif,
            MetricName::Msad => FilterName::Msad,
        }
    }

    /// Whether per-frame values are only available in ffmpeg's console output
    /// (printed by a metadata stage) instead of a log file.
    pub fn reads_console(&self) -> bool {
        matches!(self, MetricName::Vif | MetricName::Msad)
    }

    /// Sub-metric used when a single line per metric is plotted.
    pub fn headline_key(&self) -> &'static str {
        match self {
            MetricName::Psnr => "psnr_avg",
            MetricName::Ssim => "ssim_avg",
            MetricName::Vmaf => "vmaf",
            MetricName::Vif => "scale_0",
            MetricName::Msad => "msad_avg",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = QualityError;

    fn from_str(s: &str) -> Result<Self> {
        MetricName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| QualityError::Config(format!("No such metric '{}'", s)))
    }
}

/// ffmpeg's name for the filter behind a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterName {
    Psnr,
    Ssim,
    Libvmaf,
    Vif,
    Msad,
}

impl FilterName {
    pub const ALL: [FilterName; 5] = [
        FilterName::Libvmaf,
        FilterName::Psnr,
        FilterName::Ssim,
        FilterName::Vif,
        FilterName::Msad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterName::Psnr => "psnr",
            FilterName::Ssim => "ssim",
            FilterName::Libvmaf => "libvmaf",
            FilterName::Vif => "vif",
            FilterName::Msad => "msad",
        }
    }

    pub fn from_engine_name(name: &str) -> Option<FilterName> {
        FilterName::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for FilterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Per-frame data ---

/// Values of all sub-metrics of one metric for a single frame.
///
/// `n` is the frame index as reported for that metric. Sub-metrics keep the
/// order in which ffmpeg reported them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameRecord {
    pub n: u64,
    values: Vec<(String, f64)>,
}

impl FrameRecord {
    pub fn new(n: u64) -> Self {
        FrameRecord {
            n,
            values: Vec::new(),
        }
    }

    /// Sets a sub-metric, replacing an earlier value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        let key = key.into();
        match self.values.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.values.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// All frames computed for one metric, ordered by frame index.
pub type MetricSeries = Vec<FrameRecord>;

/// Harvested series keyed by metric.
pub type MetricData = BTreeMap<MetricName, MetricSeries>;

/// Rounds to three decimals, leaving non-finite values untouched.
pub fn round3(value: f64) -> f64 {
    if value.is_finite() {
        (value * 1000.0).round() / 1000.0
    } else {
        value
    }
}

// --- Serialization ---
//
// JSON has no representation for inf/nan, which PSNR produces for identical
// frames, so those are written as strings and accepted back on input.

pub(crate) fn serialize_value<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else if value.is_nan() {
        serializer.serialize_str("nan")
    } else if value.is_sign_positive() {
        serializer.serialize_str("inf")
    } else {
        serializer.serialize_str("-inf")
    }
}

pub(crate) fn deserialize_value<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    RawValue::deserialize(deserializer)?.into_f64().map_err(de::Error::custom)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    fn into_f64(self) -> std::result::Result<f64, String> {
        match self {
            RawValue::Number(v) => Ok(v),
            RawValue::Text(s) => match s.to_ascii_lowercase().as_str() {
                "inf" | "infinity" => Ok(f64::INFINITY),
                "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                _ => Err(format!("invalid metric value '{}'", s)),
            },
        }
    }
}

struct MetricValue(f64);

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serialize_value(&self.0, serializer)
    }
}

impl Serialize for FrameRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + 1))?;
        map.serialize_entry("n", &self.n)?;
        for (key, value) in &self.values {
            map.serialize_entry(key, &MetricValue(*value))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FrameRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(FrameRecordVisitor)
    }
}

struct FrameRecordVisitor;

impl<'de> Visitor<'de> for FrameRecordVisitor {
    type Value = FrameRecord;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of sub-metric names to numbers")
    }

    // A missing `n` is allowed: libvmaf keeps the frame number outside of
    // the metrics object and the caller fills it in.
    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<FrameRecord, A::Error> {
        let mut record = FrameRecord::default();
        while let Some(key) = map.next_key::<String>()? {
            if key == "n" {
                record.n = map.next_value()?;
            } else {
                let raw: RawValue = map.next_value()?;
                let value = raw.into_f64().map_err(de::Error::custom)?;
                record.insert(key, value);
            }
        }
        Ok(record)
    }
}
