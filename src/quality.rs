// src/quality.rs
//
// One comparison of a distorted video against its reference: probe ffmpeg,
// build the graph, run it once and harvest every requested metric.

use crate::artifacts::ArtifactSet;
use crate::config::RunConfig;
use crate::error::{QualityError, Result};
use crate::ffmpeg::{
    build_metric_command, invoke, probe_filters, probe_version, quoted_cmd, reconcile_framerates, EngineRunner,
    SystemEngine,
};
use crate::graph::{dialect_for, GraphBuilder, VmafStage};
use crate::harvest::harvest;
use crate::metrics::{FilterName, MetricData, MetricName};
use crate::stats::{self, GlobalStats, ResultDocument};
use crate::vmaf::VmafOptions;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info};
use std::collections::BTreeSet;

pub struct QualityMetrics {
    config: RunConfig,
    runner: Box<dyn EngineRunner>,
    available_filters: Option<BTreeSet<FilterName>>,
    data: MetricData,
}

impl QualityMetrics {
    /// Validates `config` and locates the ffmpeg executable.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let runner = SystemEngine::new(&config.ffmpeg_path)?;
        Ok(Self::assemble(config, Box::new(runner)))
    }

    /// Like [`QualityMetrics::new`] with a caller-provided way of running ffmpeg.
    pub fn with_runner(config: RunConfig, runner: Box<dyn EngineRunner>) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, runner))
    }

    fn assemble(config: RunConfig, runner: Box<dyn EngineRunner>) -> Self {
        QualityMetrics {
            config,
            runner,
            available_filters: None,
            data: MetricData::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Metric filters compiled into ffmpeg, probed on first use.
    pub fn available_filters(&mut self) -> Result<&BTreeSet<FilterName>> {
        if self.available_filters.is_none() {
            self.available_filters = Some(probe_filters(self.runner.as_ref())?);
        }
        Ok(self.available_filters.get_or_insert_with(BTreeSet::new))
    }

    /// Computes `metrics` in a single ffmpeg run, replacing any earlier
    /// results. `vmaf` is only used when VMAF is requested and falls back to
    /// the defaults.
    ///
    /// A dry run logs the command and returns empty data.
    pub fn calculate(&mut self, metrics: &[MetricName], vmaf: Option<&VmafOptions>) -> Result<&MetricData> {
        if !self.config.progress || self.config.dry_run {
            return self.run(metrics, vmaf, None);
        }

        let bar = progress_bar(metrics);
        let mut on_progress = |percent: f64| bar.set_position(percent.round() as u64);
        let result = self.run(metrics, vmaf, Some(&mut on_progress));
        bar.finish_and_clear();
        result
    }

    fn run(
        &mut self,
        metrics: &[MetricName],
        vmaf: Option<&VmafOptions>,
        on_progress: Option<&mut dyn FnMut(f64)>,
    ) -> Result<&MetricData> {
        self.data.clear();
        if metrics.is_empty() {
            return Err(QualityError::Config("No metrics specified!".to_string()));
        }
        if let Some(metric) = first_duplicate(metrics) {
            return Err(QualityError::Config(format!("Metric '{}' requested twice", metric)));
        }
        self.check_available(metrics)?;

        let default_vmaf = VmafOptions::default();
        let vmaf_stage = if metrics.contains(&MetricName::Vmaf) {
            let options = vmaf.unwrap_or(&default_vmaf);
            let model_path = options.resolve_model_path(&self.config.vmaf_model_dir)?;
            Some(VmafStage { options, model_path })
        } else {
            None
        };

        let version = probe_version(self.runner.as_ref())?;
        let dialect = dialect_for(version.as_ref());

        // Removed when dropped, including on the error paths below
        let artifacts = ArtifactSet::new(
            &self.config.tmp_dir,
            &self.config.reference,
            &self.config.distorted,
            self.config.keep_tmp_files,
        );
        let stages = GraphBuilder::new(dialect.as_ref(), self.config.scaling_algorithm).build(
            metrics,
            &artifacts,
            vmaf_stage.as_ref(),
        )?;

        let framerates = reconcile_framerates(
            self.runner.as_ref(),
            &self.config.reference,
            &self.config.distorted,
            self.config.framerate,
        )?;
        debug!("Frame rates: reference {}, distorted {}", framerates.0, framerates.1);

        let args = build_metric_command(&self.config, framerates, &stages);
        let total_secs = self.config.num_frames.map(|n| n as f64 / framerates.0);

        info!(
            "Calculating {}",
            metrics.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ")
        );
        let console = invoke(
            self.runner.as_ref(),
            &self.config,
            &args,
            on_progress.map(|callback| (total_secs, callback)),
        )?;

        if self.config.dry_run {
            return Ok(&self.data);
        }
        if console.trim().is_empty() {
            return Err(QualityError::Engine {
                command: quoted_cmd(&self.config.ffmpeg_path.to_string_lossy(), &args),
                diagnostic: "ffmpeg output is empty!".to_string(),
            });
        }

        self.data = harvest(&console, metrics, &artifacts)?;
        Ok(&self.data)
    }

    fn check_available(&mut self, metrics: &[MetricName]) -> Result<()> {
        let available = self.available_filters()?;
        for metric in metrics {
            let filter = metric.filter();
            if available.contains(&filter) {
                continue;
            }
            if filter == FilterName::Libvmaf {
                error!(
                    "Your ffmpeg build does not have support for VMAF. Make sure you download or build a version compiled with --enable-libvmaf!"
                );
            }
            return Err(QualityError::UnsupportedMetric {
                metric: metric.to_string(),
                filter: filter.to_string(),
            });
        }
        Ok(())
    }

    /// Per-frame results of the last [`QualityMetrics::calculate`].
    pub fn data(&self) -> &MetricData {
        &self.data
    }

    pub fn global_stats(&self) -> GlobalStats {
        stats::global_stats(&self.data)
    }

    pub fn to_document(&self) -> ResultDocument {
        ResultDocument::new(&self.data, &self.config.reference, &self.config.distorted)
    }

    pub fn to_json(&self) -> Result<String> {
        self.to_document().to_json()
    }

    pub fn to_csv(&self) -> Result<String> {
        stats::to_csv(&self.data, &self.config.reference, &self.config.distorted)
    }
}

fn first_duplicate(metrics: &[MetricName]) -> Option<MetricName> {
    metrics
        .iter()
        .enumerate()
        .find(|(i, metric)| metrics[..*i].contains(*metric))
        .map(|(_, metric)| *metric)
}

fn progress_bar(metrics: &[MetricName]) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(Some(100), ProgressDrawTarget::stderr());
    let style = ProgressStyle::default_bar()
        .template("  {msg}: {percent:>3}% [{bar:30}] ({elapsed} / {duration})")
        .map(|style| style.progress_chars("##."))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message(metrics.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", "));
    bar
}
