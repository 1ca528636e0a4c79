// src/graph.rs
//
// Builds the -filter_complex graph: scale the distorted input to the
// reference geometry, reset timestamps, split both branches once per metric
// and attach one metric filter to each (distorted, reference) pair.
// Input 0 is the reference, input 1 the distorted video.

use crate::artifacts::ArtifactSet;
use crate::config::ScalingAlgorithm;
use crate::ffmpeg::EngineVersion;
use crate::error::{QualityError, Result};
use crate::metrics::{FilterName, MetricName};
use crate::vmaf::VmafOptions;
use log::debug;
use std::path::{Path, PathBuf};

/// The two ways of bringing the distorted stream to the reference size.
pub trait GraphDialect {
    fn name(&self) -> &'static str;

    /// Stages ending in the `[distpts]` and `[refpts]` labels.
    fn prepare(&self, scaling: ScalingAlgorithm) -> Vec<String>;
}

/// `scale2ref`, for ffmpeg before 7.1.
pub struct ScaleToReference;

impl GraphDialect for ScaleToReference {
    fn name(&self) -> &'static str {
        "scale2ref"
    }

    fn prepare(&self, scaling: ScalingAlgorithm) -> Vec<String> {
        vec![
            format!("[1][0]scale2ref=flags={}[dist][ref]", scaling),
            "[dist]setpts=PTS-STARTPTS[distpts]".to_string(),
            "[ref]setpts=PTS-STARTPTS[refpts]".to_string(),
        ]
    }
}

/// `scale=rw:rh` with the reference as second input; scale2ref is deprecated
/// from ffmpeg 7.1 on.
pub struct ScaleWithReferenceSize;

impl GraphDialect for ScaleWithReferenceSize {
    fn name(&self) -> &'static str {
        "scale=rw:rh"
    }

    fn prepare(&self, scaling: ScalingAlgorithm) -> Vec<String> {
        vec![
            format!("[1][0]scale=rw:rh:flags={}[dist]", scaling),
            "[dist]settb=AVTB,setpts=PTS-STARTPTS[distpts]".to_string(),
            "[0]settb=AVTB,setpts=PTS-STARTPTS[refpts]".to_string(),
        ]
    }
}

/// Picks the dialect for a probed ffmpeg version. Unknown versions (git
/// builds) get the current one.
pub fn dialect_for(version: Option<&EngineVersion>) -> Box<dyn GraphDialect> {
    match version {
        Some(v) if !v.supports_scale_reference_size() => Box::new(ScaleToReference),
        _ => Box::new(ScaleWithReferenceSize),
    }
}

/// VMAF settings with the model already resolved.
pub struct VmafStage<'a> {
    pub options: &'a VmafOptions,
    pub model_path: PathBuf,
}

pub struct GraphBuilder<'a> {
    dialect: &'a dyn GraphDialect,
    scaling: ScalingAlgorithm,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(dialect: &'a dyn GraphDialect, scaling: ScalingAlgorithm) -> Self {
        GraphBuilder { dialect, scaling }
    }

    /// Returns the graph stages, to be joined with `;`.
    ///
    /// Metric stages appear in the order of `metrics`.
    pub fn build(
        &self,
        metrics: &[MetricName],
        artifacts: &ArtifactSet,
        vmaf: Option<&VmafStage<'_>>,
    ) -> Result<Vec<String>> {
        if metrics.is_empty() {
            return Err(QualityError::Config("No metrics specified!".to_string()));
        }
        for (i, metric) in metrics.iter().enumerate() {
            if metrics[..i].contains(metric) {
                return Err(QualityError::Config(format!("Metric '{}' requested twice", metric)));
            }
        }

        let mut stages = self.dialect.prepare(self.scaling);

        let n_splits = metrics.len();
        if n_splits == 1 {
            let filter = metric_stage(metrics[0], artifacts, vmaf)?;
            stages.push(format!("[distpts][refpts]{}", filter));
        } else {
            for source in ["dist", "ref"] {
                let outputs: String = (1..=n_splits).map(|n| format!("[{}{}]", source, n)).collect();
                stages.push(format!("[{}pts]split={}{}", source, n_splits, outputs));
            }
            for (n, metric) in (1..=n_splits).zip(metrics) {
                let filter = metric_stage(*metric, artifacts, vmaf)?;
                stages.push(format!("[dist{}][ref{}]{}", n, n, filter));
            }
        }

        debug!("Filter graph ({} dialect): {}", self.dialect.name(), stages.join(";"));
        Ok(stages)
    }
}

fn metric_stage(metric: MetricName, artifacts: &ArtifactSet, vmaf: Option<&VmafStage<'_>>) -> Result<String> {
    let filter = metric.filter();
    match filter {
        FilterName::Psnr | FilterName::Ssim => {
            let path = artifact_path(artifacts, filter)?;
            Ok(format!("{}='{}'", filter, escape_filter_path(path)))
        }
        FilterName::Libvmaf => {
            let stage = vmaf.ok_or_else(|| {
                QualityError::Config("VMAF requested without VMAF options".to_string())
            })?;
            let log_path = artifact_path(artifacts, filter)?;
            Ok(format!(
                "libvmaf='{}'",
                stage.options.filter_options(&stage.model_path, log_path)
            ))
        }
        // No log file for these, values are printed per frame
        FilterName::Vif | FilterName::Msad => Ok(format!("{},metadata=mode=print", filter)),
    }
}

fn artifact_path(artifacts: &ArtifactSet, filter: FilterName) -> Result<&Path> {
    artifacts
        .path(filter)
        .ok_or_else(|| QualityError::Config(format!("No log file allocated for filter '{}'", filter)))
}

/// Formats a path for use inside a filter option. ffmpeg treats `:` and `\`
/// specially, which only matters for Windows paths.
pub fn escape_filter_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if cfg!(windows) {
        s.replace('\\', "/").replace(':', "\\:")
    } else {
        s.into_owned()
    }
}
