use ffqm::{EngineOutput, EngineRunner, MetricName, QualityError, QualityMetrics, ResultDocument, RunConfig, VmafOptions};
use regex::Regex;
use std::cell::RefCell;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::{tempdir, TempDir};

const ALL_FILTERS: [&str; 5] = ["psnr", "ssim", "libvmaf", "vif", "msad"];

/// Stands in for ffmpeg: answers the probes and, for the metric run, writes
/// log files and prints metadata lines the way the real filters do.
#[derive(Clone)]
struct FakeEngine {
    filters: Vec<&'static str>,
    version: &'static str,
    frames: u64,
    silent: bool,
    skip_ssim_log: bool,
    calls: Rc<RefCell<Vec<Vec<String>>>>,
}

impl FakeEngine {
    fn new() -> Self {
        FakeEngine {
            filters: ALL_FILTERS.to_vec(),
            version: "ffmpeg version 7.1 Copyright (c) 2000-2024 the FFmpeg developers",
            frames: 3,
            silent: false,
            skip_ssim_log: false,
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn metric_runs(&self) -> Vec<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .filter(|args| args.iter().any(|a| a == "-filter_complex"))
            .cloned()
            .collect()
    }

    fn compute(&self, args: &[String]) -> ffqm::Result<EngineOutput> {
        let graph = value_after(args, "-filter_complex").unwrap_or_default();
        let frames = value_after(args, "-frames:v")
            .and_then(|n| n.parse::<u64>().ok())
            .map_or(self.frames, |n| n.min(self.frames));

        if let Some(path) = capture(&graph, r"ssim='([^']+)'").filter(|_| !self.skip_ssim_log) {
            let lines: Vec<String> = (1..=frames)
                .map(|i| format!("n:{} Y:0.9{} U:0.95 V:0.96 All:0.93{} (12.0)", i, i, i))
                .collect();
            fs::write(path, lines.join("\n"))?;
        }
        if let Some(path) = capture(&graph, r"psnr='([^']+)'") {
            let lines: Vec<String> = (1..=frames)
                .map(|i| {
                    format!(
                        "n:{} mse_avg:1.5 mse_y:2.0 mse_u:1.0 mse_v:1.0 psnr_avg:4{}.5 psnr_y:40.0 psnr_u:45.0 psnr_v:45.0",
                        i, i
                    )
                })
                .collect();
            fs::write(path, lines.join("\n"))?;
        }
        if let Some(path) = capture(&graph, r"log_path=([^:']+)") {
            let frames: Vec<String> = (0..frames)
                .map(|i| {
                    format!(
                        r#"{{"frameNum": {}, "metrics": {{"integer_adm2": 0.98, "integer_motion2": 0.0, "vmaf": 9{}.25}}}}"#,
                        i, i
                    )
                })
                .collect();
            fs::write(path, format!(r#"{{"version": "3.0.0", "frames": [{}]}}"#, frames.join(",")))?;
        }

        let mut stderr = String::from("Input #0, matroska,webm, from 'ref.mkv':\n  Duration: 00:00:00.12, start: 0.000000\n");
        for i in 0..frames {
            if graph.contains("vif,metadata=mode=print") {
                stderr.push_str(&format!("[Parsed_metadata_5 @ 0x55d] frame:{}    pts:{}      pts_time:0.0{}\n", i, i, i));
                stderr.push_str(&format!("[Parsed_metadata_5 @ 0x55d] lavfi.vif.scale.0=0.6{}\n", i));
                stderr.push_str("[Parsed_metadata_5 @ 0x55d] lavfi.vif.scale.1=0.8\n");
            }
            if graph.contains("msad,metadata=mode=print") {
                stderr.push_str(&format!("[Parsed_metadata_8 @ 0x77e] frame:{}    pts:{}      pts_time:0.0{}\n", i, i, i));
                stderr.push_str("[Parsed_metadata_8 @ 0x77e] lavfi.msad.msad.Y=0.03\n");
                stderr.push_str("[Parsed_metadata_8 @ 0x77e] lavfi.msad.msad_avg=0.025\n");
            }
        }
        stderr.push_str(&format!("frame=    {} fps=0.0 q=-0.0 Lsize=N/A time=00:00:00.12\n", frames));

        if self.silent {
            stderr.clear();
        }
        Ok(EngineOutput {
            stdout: String::new(),
            stderr,
        })
    }
}

impl EngineRunner for FakeEngine {
    fn run(&self, args: &[String], _allow_error: bool) -> ffqm::Result<EngineOutput> {
        self.calls.borrow_mut().push(args.to_vec());
        match args.first().map(String::as_str) {
            Some("-filters") => {
                let mut stdout = String::from("Filters:\n  T.. = Timeline support\n  ------\n");
                for filter in &self.filters {
                    stdout.push_str(&format!(" TS. {:<17} VV->V      Calculate the {}.\n", filter, filter));
                }
                stdout.push_str(" ... scale             V->V       Scale the input video size.\n");
                Ok(EngineOutput { stdout, stderr: String::new() })
            }
            Some("-version") => Ok(EngineOutput {
                stdout: format!("{}\nbuilt with gcc 13\n", self.version),
                stderr: String::new(),
            }),
            _ if args.iter().any(|a| a == "-filter_complex") => self.compute(args),
            _ => Ok(EngineOutput {
                stdout: String::new(),
                stderr: "Input #0, matroska,webm:\n    Stream #0:0: Video: ffv1, yuv420p, 320x240, 25 fps, 25 tbr, 1k tbn\nAt least one output file must be specified\n".to_string(),
            }),
        }
    }

    fn run_with_progress(
        &self,
        args: &[String],
        _total_secs: Option<f64>,
        on_progress: &mut dyn FnMut(f64),
    ) -> ffqm::Result<EngineOutput> {
        on_progress(50.0);
        on_progress(100.0);
        self.run(args, false)
    }
}

fn value_after(args: &[String], flag: &str) -> Option<String> {
    let i = args.iter().position(|a| a == flag)?;
    args.get(i + 1).cloned()
}

fn capture(text: &str, pattern: &str) -> Option<PathBuf> {
    let re = Regex::new(pattern).ok()?;
    re.captures(text).map(|c| PathBuf::from(&c[1]))
}

struct Workspace {
    dir: TempDir,
    config: RunConfig,
}

fn workspace() -> Result<Workspace, Box<dyn Error>> {
    let dir = tempdir()?;
    let reference = dir.path().join("ref.mkv");
    let distorted = dir.path().join("dist.mkv");
    fs::write(&reference, b"reference")?;
    fs::write(&distorted, b"distorted")?;

    let mut config = RunConfig::new(&reference, &distorted);
    config.tmp_dir = dir.path().join("work");
    Ok(Workspace { dir, config })
}

fn vmaf_options(dir: &Path) -> Result<VmafOptions, Box<dyn Error>> {
    let model = dir.join("vmaf_v0.6.1.json");
    fs::write(&model, "{}")?;
    Ok(VmafOptions {
        model_path: Some(model.to_string_lossy().into_owned()),
        ..VmafOptions::default()
    })
}

fn leftover_artifacts(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("ffqm_"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn ssim_on_three_frames() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let engine = FakeEngine::new();
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine.clone()))?;

    let data = qm.calculate(&[MetricName::Ssim], None)?;
    let ssim = &data[&MetricName::Ssim];
    assert_eq!(ssim.len(), 3);
    assert_eq!(ssim.iter().map(|f| f.n).collect::<Vec<_>>(), vec![1, 2, 3]);
    for frame in ssim {
        assert_eq!(frame.keys().collect::<Vec<_>>(), vec!["ssim_y", "ssim_u", "ssim_v", "ssim_avg"]);
    }
    assert_eq!(ssim[1].get("ssim_y"), Some(0.92));

    let stats = qm.global_stats();
    let avg = &stats[&MetricName::Ssim]["ssim_avg"];
    assert_eq!(avg.average, 0.932);
    assert_eq!(avg.median, 0.932);
    assert_eq!(avg.min, 0.931);
    assert_eq!(avg.max, 0.933);
    assert_eq!(stats[&MetricName::Ssim].len(), 4);

    assert_eq!(engine.metric_runs().len(), 1);
    assert_eq!(leftover_artifacts(&ws.config.tmp_dir), 0);
    Ok(())
}

#[test]
fn frame_cap_limits_series() -> Result<(), Box<dyn Error>> {
    let mut ws = workspace()?;
    ws.config.num_frames = Some(2);
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(FakeEngine::new()))?;
    let data = qm.calculate(&[MetricName::Psnr], None)?;
    assert_eq!(data[&MetricName::Psnr].iter().map(|f| f.n).collect::<Vec<_>>(), vec![1, 2]);

    ws.config.num_frames = Some(10);
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(FakeEngine::new()))?;
    let data = qm.calculate(&[MetricName::Psnr], None)?;
    assert_eq!(data[&MetricName::Psnr].len(), 3);
    Ok(())
}

#[test]
fn unsupported_metric_fails_before_metric_run() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let mut engine = FakeEngine::new();
    engine.filters = vec!["psnr", "ssim"];
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine.clone()))?;

    let err = qm.calculate(&[MetricName::Ssim, MetricName::Vmaf], None).unwrap_err();
    assert!(err.is_configuration());
    assert!(matches!(err, QualityError::UnsupportedMetric { ref filter, .. } if filter == "libvmaf"));
    assert!(engine.metric_runs().is_empty());
    Ok(())
}

#[test]
fn dry_run_skips_metric_run() -> Result<(), Box<dyn Error>> {
    let mut ws = workspace()?;
    ws.config.dry_run = true;
    let engine = FakeEngine::new();
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine.clone()))?;

    assert!(qm.calculate(&[MetricName::Psnr, MetricName::Ssim], None)?.is_empty());
    assert!(engine.metric_runs().is_empty());
    assert_eq!(leftover_artifacts(&ws.config.tmp_dir), 0);
    Ok(())
}

#[test]
fn adding_metrics_keeps_earlier_values() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let vmaf = vmaf_options(ws.dir.path())?;
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(FakeEngine::new()))?;

    let first = qm.calculate(&[MetricName::Ssim, MetricName::Psnr], None)?.clone();
    let second = qm
        .calculate(&[MetricName::Ssim, MetricName::Psnr, MetricName::Vmaf], Some(&vmaf))?
        .clone();

    assert_eq!(first[&MetricName::Ssim], second[&MetricName::Ssim]);
    assert_eq!(first[&MetricName::Psnr], second[&MetricName::Psnr]);
    let vmaf_series = &second[&MetricName::Vmaf];
    assert_eq!(vmaf_series.iter().map(|f| f.n).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(vmaf_series[0].get("vmaf"), Some(90.25));

    // A new calculation replaces the previous results
    let third = qm.calculate(&[MetricName::Vif], None)?;
    assert_eq!(third.keys().collect::<Vec<_>>(), vec![&MetricName::Vif]);
    Ok(())
}

#[test]
fn console_metrics_keep_zero_based_frames() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let engine = FakeEngine::new();
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine.clone()))?;

    let data = qm.calculate(&[MetricName::Psnr, MetricName::Vif, MetricName::Msad], None)?;
    let vif = &data[&MetricName::Vif];
    assert_eq!(vif.iter().map(|f| f.n).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(vif[2].keys().collect::<Vec<_>>(), vec!["scale_0", "scale_1"]);
    assert_eq!(vif[2].get("scale_0"), Some(0.62));
    assert_eq!(data[&MetricName::Msad][0].keys().collect::<Vec<_>>(), vec!["msad_y", "msad_avg"]);

    let graph = value_after(&engine.metric_runs()[0], "-filter_complex").unwrap_or_default();
    assert!(graph.contains("[distpts]split=3[dist1][dist2][dist3]"));
    assert!(graph.contains("[dist2][ref2]vif,metadata=mode=print"));

    // Only frames 1 and 2 are reported by every metric
    let csv = qm.to_csv()?;
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("n,mse_avg,"));
    assert!(lines[0].ends_with(",scale_0,scale_1,msad_y,msad_avg,input_file_dist,input_file_ref"));
    assert!(lines[1].starts_with("1,1.5,"));
    assert!(lines[2].starts_with("2,"));
    Ok(())
}

#[test]
fn json_document_round_trips() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(FakeEngine::new()))?;
    qm.calculate(&[MetricName::Ssim, MetricName::Psnr], None)?;

    let json = qm.to_json()?;
    let value: serde_json::Value = serde_json::from_str(&json)?;
    assert_eq!(value["ssim"][0]["n"], 1);
    assert_eq!(value["psnr"][2]["psnr_avg"], 43.5);
    assert!(value["global"]["psnr"]["psnr_avg"]["stdev"].is_number());
    assert!(value.get("vmaf").is_none());
    assert_eq!(value["input_file_ref"], ws.config.reference.to_string_lossy().into_owned());

    let back = ResultDocument::from_json(&json)?;
    assert_eq!(&back.metrics, qm.data());
    assert_eq!(back.global, qm.global_stats());
    Ok(())
}

#[test]
fn keeps_artifacts_on_request() -> Result<(), Box<dyn Error>> {
    let mut ws = workspace()?;
    ws.config.keep_tmp_files = true;
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(FakeEngine::new()))?;
    qm.calculate(&[MetricName::Psnr, MetricName::Ssim], None)?;
    assert_eq!(leftover_artifacts(&ws.config.tmp_dir), 2);
    Ok(())
}

#[test]
fn empty_console_output_is_an_error() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let mut engine = FakeEngine::new();
    engine.silent = true;
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine))?;

    let err = qm.calculate(&[MetricName::Ssim], None).unwrap_err();
    assert!(matches!(err, QualityError::Engine { .. }));
    assert!(!err.is_configuration());
    assert_eq!(leftover_artifacts(&ws.config.tmp_dir), 0);
    Ok(())
}

#[test]
fn older_ffmpeg_gets_scale2ref_graph() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let mut engine = FakeEngine::new();
    engine.version = "ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023";
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine.clone()))?;
    qm.calculate(&[MetricName::Psnr], None)?;

    let graph = value_after(&engine.metric_runs()[0], "-filter_complex").unwrap_or_default();
    assert!(graph.starts_with("[1][0]scale2ref=flags=bicubic[dist][ref];"));
    Ok(())
}

#[test]
fn progress_mode_reports_through_engine() -> Result<(), Box<dyn Error>> {
    let mut ws = workspace()?;
    ws.config.progress = true;
    ws.config.framerate = Some(24.0);
    let engine = FakeEngine::new();
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine.clone()))?;
    qm.calculate(&[MetricName::Ssim], None)?;

    let runs = engine.metric_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(value_after(&runs[0], "-progress").as_deref(), Some("pipe:2"));
    assert_eq!(value_after(&runs[0], "-r").as_deref(), Some("24"));
    // Forced frame rate skips probing
    assert_eq!(engine.calls.borrow().len(), 3);
    Ok(())
}

#[test]
fn rejects_empty_and_duplicate_requests() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let engine = FakeEngine::new();
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine.clone()))?;
    assert!(qm.calculate(&[], None).unwrap_err().is_configuration());
    assert!(qm
        .calculate(&[MetricName::Psnr, MetricName::Ssim, MetricName::Psnr], None)
        .unwrap_err()
        .is_configuration());
    // Rejected before ffmpeg is probed
    assert!(engine.calls.borrow().is_empty());
    Ok(())
}

#[test]
fn missing_log_file_fails_and_cleans_up() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let mut engine = FakeEngine::new();
    engine.skip_ssim_log = true;
    let mut qm = QualityMetrics::with_runner(ws.config.clone(), Box::new(engine.clone()))?;

    let err = qm.calculate(&[MetricName::Psnr, MetricName::Ssim], None).unwrap_err();
    assert!(matches!(err, QualityError::Parse(ref msg) if msg.contains("ssim")));
    assert_eq!(engine.metric_runs().len(), 1);
    // The psnr log was written and is removed as well
    assert_eq!(leftover_artifacts(&ws.config.tmp_dir), 0);
    assert!(qm.data().is_empty());
    Ok(())
}
