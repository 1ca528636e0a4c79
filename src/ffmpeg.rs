// src/ffmpeg.rs

use crate::config::RunConfig;
use crate::error::{QualityError, Result};
use crate::metrics::FilterName;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Captured console output of one ffmpeg run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Something that can run ffmpeg with a list of arguments.
pub trait EngineRunner {
    /// Runs to completion, failing on a non-zero exit unless `allow_error`.
    fn run(&self, args: &[String], allow_error: bool) -> Result<EngineOutput>;

    /// Runs to completion while reporting completion percentages.
    /// `args` must make ffmpeg write `-progress` lines to stderr.
    fn run_with_progress(
        &self,
        args: &[String],
        total_secs: Option<f64>,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<EngineOutput>;
}

/// Runs the ffmpeg executable found on the system.
#[derive(Debug, Clone)]
pub struct SystemEngine {
    program: PathBuf,
}

impl SystemEngine {
    /// Resolves `program` through `PATH` if it is not a path already.
    pub fn new(program: &Path) -> Result<Self> {
        let program = which::which(program).map_err(|e| {
            QualityError::Config(format!(
                "ffmpeg executable '{}' not found: {}",
                program.display(),
                e
            ))
        })?;
        debug!("Using ffmpeg at {}", program.display());
        Ok(SystemEngine { program })
    }

    fn command_line(&self, args: &[String]) -> String {
        quoted_cmd(&self.program.to_string_lossy(), args)
    }

    fn failure(&self, args: &[String], stdout: &str, stderr: &str) -> QualityError {
        let command = self.command_line(args);
        error!("ffmpeg command failed: {}", command);
        QualityError::Engine {
            command,
            diagnostic: format!("{}{}", stdout, stderr).trim_end().to_string(),
        }
    }
}

impl EngineRunner for SystemEngine {
    fn run(&self, args: &[String], allow_error: bool) -> Result<EngineOutput> {
        debug!("{}", self.command_line(args));

        let start_time = std::time::Instant::now();
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        let duration = start_time.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !allow_error && !output.status.success() {
            return Err(self.failure(args, &stdout, &stderr));
        }
        debug!("ffmpeg finished in {}ms ({})", duration.as_millis(), output.status);
        Ok(EngineOutput { stdout, stderr })
    }

    fn run_with_progress(
        &self,
        args: &[String],
        total_secs: Option<f64>,
        on_progress: &mut dyn FnMut(f64),
    ) -> Result<EngineOutput> {
        debug!("{}", self.command_line(args));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut tracker = ProgressTracker::new(total_secs);
        let stderr = match child.stderr.take() {
            Some(pipe) => match follow_progress(BufReader::new(pipe), &mut tracker, on_progress) {
                Ok(text) => text,
                Err(e) => {
                    error!("Lost ffmpeg output, stopping it: {}", e);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e.into());
                }
            },
            None => String::new(),
        };

        let status = child.wait()?;
        if !status.success() {
            return Err(self.failure(args, "", &stderr));
        }
        Ok(EngineOutput {
            stdout: String::new(),
            stderr,
        })
    }
}

// --- Progress ---

/// Collects ffmpeg's stderr line by line, reporting progress as it arrives.
fn follow_progress(
    reader: impl BufRead,
    tracker: &mut ProgressTracker,
    on_progress: &mut dyn FnMut(f64),
) -> std::io::Result<String> {
    let mut stderr = String::new();
    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        if let Some(percent) = tracker.feed(&line) {
            on_progress(percent);
        }
        stderr.push_str(&line);
        stderr.push('\n');
    }
    Ok(stderr)
}

static DURATION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Duration: (\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("Invalid duration Regex")
});

/// Turns ffmpeg `-progress` output into percentages.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_secs: Option<f64>,
    last_percent: f64,
}

impl ProgressTracker {
    /// `total_secs` overrides the duration ffmpeg reports for the first input.
    pub fn new(total_secs: Option<f64>) -> Self {
        ProgressTracker {
            total_secs: total_secs.filter(|t| *t > 0.0),
            last_percent: 0.0,
        }
    }

    /// Feeds one stderr line, returning a new percentage when progress was made.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();
        if self.total_secs.is_none() {
            if let Some(caps) = DURATION_REGEX.captures(line) {
                let field = |i: usize| caps[i].parse::<f64>().unwrap_or(0.0);
                let total = field(1) * 3600.0 + field(2) * 60.0 + field(3);
                if total > 0.0 {
                    self.total_secs = Some(total);
                }
                return None;
            }
        }

        if line == "progress=end" {
            return self.advance(100.0);
        }

        // out_time_ms is in microseconds as well
        let micros = line
            .strip_prefix("out_time_us=")
            .or_else(|| line.strip_prefix("out_time_ms="))?
            .parse::<f64>()
            .ok()?;
        let total = self.total_secs?;
        self.advance((micros / 1_000_000.0 / total * 100.0).clamp(0.0, 100.0))
    }

    fn advance(&mut self, percent: f64) -> Option<f64> {
        if percent > self.last_percent {
            self.last_percent = percent;
            Some(percent)
        } else {
            None
        }
    }
}

// --- Capabilities ---

static VERSION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"ffmpeg version n?(\d+)\.(\d+)").expect("Invalid version Regex")
});

/// Release version of ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
}

impl EngineVersion {
    /// Parses `ffmpeg -version` output. Git builds have no release number.
    pub fn parse(text: &str) -> Option<EngineVersion> {
        let caps = VERSION_REGEX.captures(text)?;
        Some(EngineVersion {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
        })
    }

    /// `scale=rw:rh` replaced `scale2ref` in 7.1.
    pub fn supports_scale_reference_size(&self) -> bool {
        (self.major, self.minor) >= (7, 1)
    }
}

pub fn probe_version(runner: &dyn EngineRunner) -> Result<Option<EngineVersion>> {
    let output = runner
        .run(&["-version".to_string()], false)
        .map_err(|e| QualityError::Config(format!("Could not run ffmpeg: {}", e)))?;
    let version = EngineVersion::parse(&output.stdout);
    match version {
        Some(v) => debug!("ffmpeg version {}.{}", v.major, v.minor),
        None => debug!("Could not parse ffmpeg version, assuming a recent build"),
    }
    Ok(version)
}

/// Filters this tool can drive that appear in `ffmpeg -filters` output.
pub fn parse_filter_list(text: &str) -> BTreeSet<FilterName> {
    text.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(FilterName::from_engine_name)
        .collect()
}

pub fn probe_filters(runner: &dyn EngineRunner) -> Result<BTreeSet<FilterName>> {
    let output = runner
        .run(&["-filters".to_string()], false)
        .map_err(|e| QualityError::Config(format!("Could not list ffmpeg filters: {}", e)))?;
    let available = parse_filter_list(&output.stdout);
    debug!(
        "Available filters: {}",
        available.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(available)
}

// --- Frame rates ---

static FPS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?) fps").expect("Invalid FPS Regex"));

pub fn parse_framerate(text: &str) -> Option<f64> {
    FPS_REGEX.captures(text)?[1].parse().ok()
}

/// Reads the frame rate ffmpeg reports when opening `path`.
pub fn probe_framerate(runner: &dyn EngineRunner, path: &Path) -> Result<f64> {
    let args = vec![
        "-nostdin".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
    ];
    // Exits non-zero since no output file is given
    let output = runner.run(&args, true)?;
    parse_framerate(&output.stderr)
        .or_else(|| parse_framerate(&output.stdout))
        .ok_or_else(|| QualityError::FrameRate(path.display().to_string()))
}

/// Frame rates of (reference, distorted). A forced rate skips probing.
pub fn reconcile_framerates(
    runner: &dyn EngineRunner,
    reference: &Path,
    distorted: &Path,
    forced: Option<f64>,
) -> Result<(f64, f64)> {
    if let Some(fps) = forced {
        return Ok((fps, fps));
    }
    let ref_fps = probe_framerate(runner, reference)?;
    let dist_fps = probe_framerate(runner, distorted)?;
    if ref_fps != dist_fps {
        warn!(
            "ref, dist framerates differ: {}, {}. This may result in inaccurate quality metrics. Force an input framerate via the -r option.",
            ref_fps, dist_fps
        );
    }
    Ok((ref_fps, dist_fps))
}

// --- Metric run ---

/// Full argument list for the metric computation run.
pub fn build_metric_command(config: &RunConfig, framerates: (f64, f64), stages: &[String]) -> Vec<String> {
    let (ref_fps, dist_fps) = framerates;
    let seek = config
        .start_offset
        .as_ref()
        .map(|offset| format_seconds(offset.to_seconds(ref_fps)));

    let mut args: Vec<String> = ["-nostdin", "-nostats", "-y"].iter().map(|s| s.to_string()).collect();
    args.extend(["-threads".to_string(), config.threads.to_string()]);
    if config.progress {
        args.extend(["-progress".to_string(), "pipe:2".to_string()]);
    }

    if let Some(ss) = &seek {
        args.extend(["-ss".to_string(), ss.clone()]);
    }
    args.extend([
        "-r".to_string(),
        ref_fps.to_string(),
        "-i".to_string(),
        config.reference.to_string_lossy().into_owned(),
    ]);

    if let Some(ss) = &seek {
        args.extend(["-ss".to_string(), ss.clone()]);
    }
    args.extend([
        "-itsoffset".to_string(),
        config.dist_delay.to_string(),
        "-r".to_string(),
        dist_fps.to_string(),
        "-i".to_string(),
        config.distorted.to_string_lossy().into_owned(),
    ]);

    args.extend(["-filter_complex".to_string(), stages.join(";")]);
    if let Some(n) = config.num_frames {
        args.extend(["-frames:v".to_string(), n.to_string()]);
    }
    args.extend(["-an", "-f", "null", NULL_DEVICE].iter().map(|s| s.to_string()));
    args
}

/// Runs the metric computation and returns ffmpeg's console text.
/// A dry run only logs the command.
pub fn invoke(
    runner: &dyn EngineRunner,
    config: &RunConfig,
    args: &[String],
    progress: Option<(Option<f64>, &mut dyn FnMut(f64))>,
) -> Result<String> {
    if let Some(line) = announced_command(config, args) {
        info!("{}", line);
    }
    if config.dry_run {
        return Ok(String::new());
    }

    let output = match progress {
        Some((total_secs, on_progress)) => runner.run_with_progress(args, total_secs, on_progress)?,
        None => runner.run(args, false)?,
    };
    Ok(output.stderr)
}

/// The command line shown to the user, on dry runs and in verbose mode.
pub fn announced_command(config: &RunConfig, args: &[String]) -> Option<String> {
    let command = quoted_cmd(&config.ffmpeg_path.to_string_lossy(), args);
    if config.dry_run {
        Some(format!("Dry run: {}", command))
    } else if config.verbose {
        Some(command)
    } else {
        None
    }
}

fn format_seconds(secs: f64) -> String {
    let s = format!("{:.3}", secs);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Shell-style rendering of a command for logs and error messages.
pub fn quoted_cmd(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(quote_arg)
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-+=:,./@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}
