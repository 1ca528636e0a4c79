// src/vmaf.rs

use crate::error::{QualityError, Result};
use crate::graph::escape_filter_path;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

pub const DEFAULT_VMAF_MODEL: &str = "vmaf_v0.6.1.json";
const SYSTEM_MODEL_DIR: &str = "/usr/local/share/model";

/// Options for the libvmaf filter.
#[derive(Debug, Clone, PartialEq)]
pub struct VmafOptions {
    /// Model file, or the file name of a bundled model. `None` picks the default model.
    pub model_path: Option<String>,
    /// Extra `key=value` parameters merged into the model specifier.
    pub model_params: Vec<(String, String)>,
    /// libvmaf `n_threads`, 0 = auto.
    pub n_threads: u32,
    /// libvmaf `n_subsample`, 1 = every frame.
    pub n_subsample: u32,
    pub features: Vec<VmafFeature>,
}

impl VmafOptions {
    pub const DEFAULT_THREADS: u32 = 0;
    pub const DEFAULT_SUBSAMPLE: u32 = 1;

    /// Builds the argument of `libvmaf=` for an already resolved model.
    pub fn filter_options(&self, model_path: &Path, log_path: &Path) -> String {
        let mut model = vec![format!("path={}", escape_model_path(model_path))];
        model.extend(
            self.model_params
                .iter()
                .map(|(k, v)| format!("{}={}", k, escape_colons(v))),
        );

        let mut opts: Vec<(&str, String)> = vec![
            ("model", model.join("\\:")),
            ("log_path", escape_filter_path(log_path)),
            ("log_fmt", "json".to_string()),
            ("n_threads", self.n_threads.to_string()),
            ("n_subsample", self.n_subsample.to_string()),
        ];

        if !self.features.is_empty() {
            let features: Vec<String> = self.features.iter().map(VmafFeature::to_option).collect();
            opts.push(("feature", features.join("|")));
        }

        opts.iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Resolves `model_path` to an existing model file.
    pub fn resolve_model_path(&self, model_dir: &Path) -> Result<PathBuf> {
        let requested = match &self.model_path {
            Some(path) => PathBuf::from(path),
            None => default_model_path(model_dir),
        };
        if requested.is_file() {
            debug!("Using VMAF model {}", requested.display());
            return Ok(requested);
        }

        // Also accept the bare file name of a bundled model
        let bundled = supplied_models(model_dir);
        if let Some(name) = requested.to_str() {
            if bundled.iter().any(|m| m == name) {
                let path = model_dir.join(name);
                debug!("Using bundled VMAF model {}", path.display());
                return Ok(path);
            }
        }

        Err(QualityError::Config(format!(
            "Could not find model at {}. Please set --vmaf-model-path to a valid VMAF .json model file{}",
            requested.display(),
            if bundled.is_empty() {
                String::new()
            } else {
                format!(" or one of the bundled models: {}", bundled.join(", "))
            }
        )))
    }
}

impl Default for VmafOptions {
    fn default() -> Self {
        VmafOptions {
            model_path: None,
            model_params: Vec::new(),
            n_threads: Self::DEFAULT_THREADS,
            n_subsample: Self::DEFAULT_SUBSAMPLE,
            features: Vec::new(),
        }
    }
}

/// An additional libvmaf feature extractor, e.g. `cambi:full_ref=true`.
#[derive(Debug, Clone, PartialEq)]
pub struct VmafFeature {
    pub name: String,
    pub params: Vec<(String, String)>,
}

impl VmafFeature {
    fn to_option(&self) -> String {
        let mut parts = vec![format!("name={}", self.name)];
        parts.extend(self.params.iter().map(|(k, v)| format!("{}={}", k, v)));
        parts.join("\\:")
    }
}

impl FromStr for VmafFeature {
    type Err = QualityError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':').filter(|p| !p.is_empty());
        let first = parts
            .next()
            .ok_or_else(|| QualityError::Config("Empty VMAF feature".to_string()))?;
        let name = first.strip_prefix("name=").unwrap_or(first).to_string();
        if name.is_empty() || name.contains('=') {
            return Err(QualityError::Config(format!("Invalid VMAF feature '{}'", s)));
        }
        let params = parts.map(parse_key_value).collect::<Result<Vec<_>>>()?;
        Ok(VmafFeature { name, params })
    }
}

/// Splits `key=value`.
pub fn parse_key_value(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(QualityError::Config(format!(
            "Invalid parameter '{}', expected key=value",
            s
        ))),
    }
}

/// Names of the `.json` models found in `model_dir`.
pub fn supplied_models(model_dir: &Path) -> Vec<String> {
    let mut models: Vec<String> = fs::read_dir(model_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| name.ends_with(".json"))
                .collect()
        })
        .unwrap_or_default();
    models.sort();
    models
}

/// Default model from a Homebrew libvmaf, then a system-wide install,
/// otherwise the bundled one.
pub fn default_model_path(model_dir: &Path) -> PathBuf {
    if let Some(dir) = brewed_model_dir() {
        return dir.join(DEFAULT_VMAF_MODEL);
    }
    let share = Path::new(SYSTEM_MODEL_DIR);
    if share.is_dir() {
        share.join(DEFAULT_VMAF_MODEL)
    } else {
        model_dir.join(DEFAULT_VMAF_MODEL)
    }
}

/// Only consulted when ffmpeg itself was installed with Homebrew.
fn brewed_model_dir() -> Option<PathBuf> {
    let brew = which::which("brew").ok()?;
    let ffmpeg = which::which("ffmpeg").ok()?;
    if !is_brewed(&ffmpeg) {
        return None;
    }
    let output = Command::new(brew).args(["--prefix", "libvmaf"]).output().ok()?;
    let prefix = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if prefix.is_empty() {
        return None;
    }
    brew_model_dir(Path::new(&prefix))
}

fn is_brewed(ffmpeg: &Path) -> bool {
    fs::read_link(ffmpeg)
        .map(|target| target.to_string_lossy().contains("Cellar/ffmpeg"))
        .unwrap_or(false)
}

fn brew_model_dir(prefix: &Path) -> Option<PathBuf> {
    let dir = prefix.join("share").join("libvmaf").join("model");
    if dir.is_dir() {
        Some(dir)
    } else {
        warn!(
            "{} does not exist. Are you sure you have installed the most recent version of libvmaf with Homebrew?",
            dir.display()
        );
        None
    }
}

fn escape_colons(value: &str) -> String {
    value.replace(':', "\\:")
}

fn escape_model_path(path: &Path) -> String {
    let escaped = escape_filter_path(path);
    if cfg!(windows) {
        escaped.replace('\\', "\\\\\\")
    } else {
        escaped
    }
}
