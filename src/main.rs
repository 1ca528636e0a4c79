mod cli;

use crate::cli::{CliArgs, OutputFormat};
use chrono::Local;
use ffqm::{plot, QualityError, QualityMetrics, Result};
use log::{debug, error, info, warn, LevelFilter};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

fn main() -> ExitCode {
    let start_time = Instant::now();

    let args = cli::parse_args();

    if let Err(e) = setup_logging(&args) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Arguments: {:?}", args);

    let verbose = args.verbose;
    match run(args) {
        Ok(()) => {
            info!("Finished in {:.2?}", start_time.elapsed());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed after {:.2?}: {}", start_time.elapsed(), e);
            if verbose {
                debug!("{:?}", e);
            }
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs to stderr, and to a file with `--log`. stdout carries the results.
fn setup_logging(args: &CliArgs) -> std::result::Result<(), fern::InitError> {
    let crate_level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Info)
        .level_for("ffqm", crate_level);

    let console_config = fern::Dispatch::new().chain(std::io::stderr());
    let mut logger = base_config.chain(console_config);

    let mut log_path = None;
    if args.log {
        let path = PathBuf::from(format!("ffqm_{}.log", Local::now().format("%Y%m%d_%H%M%S")));
        logger = logger.chain(fern::Dispatch::new().chain(fern::log_file(&path)?));
        log_path = Some(path);
    }

    logger.apply()?;
    if let Some(path) = log_path {
        info!("Logging to file: {}", path.display());
    }
    Ok(())
}

fn run(args: CliArgs) -> Result<()> {
    info!("Reference: {}", args.reference.display());
    info!("Distorted: {}", args.distorted.display());

    let mut metrics = QualityMetrics::new(args.run_config())?;
    let vmaf_options = args.vmaf_options();
    metrics.calculate(&args.metrics, vmaf_options.as_ref())?;

    if args.dry_run {
        warn!("Dry run specified, exiting without computing stats");
        return Ok(());
    }

    let output = match args.output_format {
        OutputFormat::Json => metrics.to_json()?,
        OutputFormat::Csv => metrics.to_csv()?,
    };
    match &args.output_file {
        Some(path) => {
            fs::write(path, &output)?;
            info!("Results written to {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(output.as_bytes())?;
            if !output.ends_with('\n') {
                stdout.write_all(b"\n")?;
            }
        }
    }

    if let Some(dir) = &args.plot_dir {
        let prefix = args
            .distorted
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| QualityError::Config(format!("Invalid distorted path {}", args.distorted.display())))?;
        for path in plot::plot_all(metrics.data(), dir, &prefix)? {
            info!("Plot saved: {}", path.display());
        }
    }

    Ok(())
}
