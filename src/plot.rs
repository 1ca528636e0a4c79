// src/plot.rs

use crate::error::{QualityError, Result};
use crate::metrics::{MetricData, MetricName, MetricSeries};
use log::{info, warn};
use plotters::prelude::*;
use plotters::style::full_palette::{GREEN, ORANGE};
use quantiles::ckms::CKMS;
use std::path::{Path, PathBuf};

/// Identical frames give an infinite PSNR, drawn at this value instead.
const PSNR_CAP_VALUE: f64 = 100.0;

/// Writes one `<prefix>.<metric>.png` per non-empty series into `dir`.
pub fn plot_all(data: &MetricData, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        info!("Creating plot directory: {}", dir.display());
        std::fs::create_dir_all(dir)?;
    }
    let mut written = Vec::new();
    for (metric, series) in data.iter().filter(|(_, s)| !s.is_empty()) {
        let path = dir.join(format!("{}.{}.png", prefix, metric));
        generate_plot(series, *metric, &path)?;
        written.push(path);
    }
    Ok(written)
}

/// Plots the headline sub-metric of `metric` over the frame index, with the
/// mean and the 1st, 25th and 75th percentiles as horizontal lines.
pub fn generate_plot(series: &MetricSeries, metric: MetricName, output_path: &Path) -> Result<()> {
    let key = metric.headline_key();
    info!("Generating {} plot: {}", key, output_path.display());

    let mut capped = 0;
    let points: Vec<(u64, f64)> = series
        .iter()
        .filter_map(|frame| {
            let value = frame.get(key)?;
            if value.is_nan() {
                None
            } else if value.is_infinite() {
                capped += 1;
                Some((frame.n, if value > 0.0 { PSNR_CAP_VALUE } else { 0.0 }))
            } else {
                Some((frame.n, value))
            }
        })
        .collect();

    if capped > 0 {
        info!("Capped {} infinite {} values to {} for plotting", capped, key, PSNR_CAP_VALUE);
    }
    if points.is_empty() {
        warn!("No {} values to plot for {}", key, output_path.display());
        return Err(QualityError::Plot(format!("No valid {} values to plot", key)));
    }

    let mut sorted: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut quantiles = CKMS::<f64>::new(0.001);
    for value in &sorted {
        quantiles.insert(*value);
    }
    // CKMS returns the rank, the value is looked up in the sorted data
    let percentile = |q: f64| -> f64 {
        quantiles
            .query(q)
            .and_then(|(rank, _)| sorted.get(rank.min(sorted.len() - 1)).copied())
            .unwrap_or(f64::NAN)
    };
    let perc_1 = percentile(0.01);
    let perc_25 = percentile(0.25);
    let perc_75 = percentile(0.75);

    let min_value = sorted[0];
    let max_value = sorted[sorted.len() - 1];
    let (y_min, y_max) = y_range(metric, min_value, max_value);
    let x_min = points[0].0;
    let x_max = points[points.len() - 1].0.max(x_min + 1);

    let root = BitMapBackend::new(output_path, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| QualityError::Plot(format!("Failed to fill plot background: {}", e)))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(format!("{} ({} frames)", key, points.len()), ("sans-serif", 24).into_font())
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(|e| QualityError::Plot(format!("Failed to build chart: {}", e)))?;

    let y_label_format = |y: &f64| format!("{:.2}", y);
    chart
        .configure_mesh()
        .x_desc("Frame Number")
        .y_desc(key)
        .y_label_formatter(&y_label_format)
        .axis_desc_style(("sans-serif", 16))
        .label_style(("sans-serif", 14))
        .y_max_light_lines(5)
        .draw()
        .map_err(|e| QualityError::Plot(format!("Failed to draw mesh: {:?}", e)))?;

    chart
        .draw_series(LineSeries::new(points.iter().copied(), BLUE.mix(0.8).stroke_width(1)))
        .map_err(|e| QualityError::Plot(format!("Failed to draw {} series: {:?}", key, e)))?
        .label(key)
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE.filled()));

    let stat_lines = [
        (format!("Mean: {:.3}", mean), mean, BLACK),
        (format!("1%:   {:.3}", perc_1), perc_1, RED),
        (format!("25%: {:.3}", perc_25), perc_25, ORANGE),
        (format!("75%: {:.3}", perc_75), perc_75, GREEN),
    ];
    for (label, value, color) in stat_lines {
        chart
            .draw_series(LineSeries::new(vec![(x_min, value), (x_max, value)], stat_line_style(color)))
            .map_err(|e| QualityError::Plot(format!("Failed to draw '{}' line: {:?}", label, e)))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], stat_line_style(color)));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerMiddle)
        .margin(10)
        .label_font(("sans-serif", 12))
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(|e| QualityError::Plot(format!("Failed to draw legend: {:?}", e)))?;

    root.present()
        .map_err(|e| QualityError::Plot(format!("Failed to save plot: {:?}", e)))?;
    info!("Generated {} plot: {}", metric, output_path.display());
    Ok(())
}

/// Value axis per metric. Bounded scores keep their natural scale.
fn y_range(metric: MetricName, min: f64, max: f64) -> (f64, f64) {
    match metric {
        MetricName::Vmaf => (min.floor().clamp(0.0, 95.0), 100.5),
        MetricName::Ssim | MetricName::Vif => ((min - 0.01).max(0.0), (max + 0.01).min(1.0).max(min + 0.01)),
        MetricName::Psnr => ((min.floor() - 1.0).max(0.0), (max.ceil() + 1.0).min(PSNR_CAP_VALUE + 5.0)),
        MetricName::Msad => {
            let pad = ((max - min) * 0.05).max(0.001);
            ((min - pad).max(0.0), max + pad)
        }
    }
}

fn stat_line_style(color: RGBColor) -> ShapeStyle {
    ShapeStyle {
        color: color.to_rgba(),
        filled: false,
        stroke_width: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_stay_within_metric_bounds() {
        assert_eq!(y_range(MetricName::Vmaf, 87.3, 99.0), (87.0, 100.5));
        let (lo, hi) = y_range(MetricName::Ssim, 0.95, 1.0);
        assert!(lo < 0.95 && hi <= 1.0 && hi > lo);
        let (lo, hi) = y_range(MetricName::Psnr, 30.2, 100.0);
        assert_eq!((lo, hi), (29.0, 101.0));
    }

    #[test]
    fn rejects_series_without_headline_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut frame = crate::metrics::FrameRecord::new(1);
        frame.insert("psnr_y", 30.0);
        let err = generate_plot(&vec![frame], MetricName::Psnr, &dir.path().join("p.png")).unwrap_err();
        assert!(matches!(err, QualityError::Plot(_)));
    }
}
