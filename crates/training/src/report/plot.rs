use std::path::{Path, PathBuf};

use crate::metrics::MetricTrends;

type PlotResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Renders loss, accuracy and learning-rate curves as SVG files in `dir`.
#[cfg(feature = "plots")]
pub fn plot_trends(
    dir: &Path,
    tags: &[String],
    epoch: usize,
    trends: &MetricTrends,
) -> PlotResult<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let slug = super::tag_slug(tags);
    let caption = tags.join(", ");

    let loss_path = dir.join(format!("loss_{slug}_epoch{epoch}.svg"));
    draw_curves(
        &loss_path,
        &format!("Loss vs. epochs (epoch {epoch}) {caption}"),
        "epoch",
        "loss",
        &[("train", &trends.train_loss), ("valid", &trends.valid_loss)],
    )?;

    let acc_path = dir.join(format!("acc_{slug}_epoch{epoch}.svg"));
    draw_curves(
        &acc_path,
        &format!("Accuracy vs. epochs (epoch {epoch}) {caption}"),
        "epoch",
        "accuracy (%)",
        &[("train", &trends.train_acc), ("valid", &trends.valid_acc)],
    )?;

    let lr_path = dir.join(format!("lr_{slug}_epoch{epoch}.svg"));
    draw_curves(
        &lr_path,
        &format!("Learning rate vs. batch no. (epoch {epoch}) {caption}"),
        "batch",
        "learning rate",
        &[("lr", &trends.learning_rate)],
    )?;

    Ok(vec![loss_path, acc_path, lr_path])
}

#[cfg(feature = "plots")]
fn draw_curves(
    path: &Path,
    caption: &str,
    x_desc: &str,
    y_desc: &str,
    series: &[(&str, &Vec<f64>)],
) -> PlotResult<()> {
    use plotters::prelude::*;

    const COLORS: [RGBColor; 2] = [BLUE, RED];

    let points = series.iter().map(|(_, values)| values.len()).max().unwrap_or(0);
    let (mut y_min, mut y_max) = series
        .iter()
        .flat_map(|(_, values)| values.iter().copied())
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !y_min.is_finite() || !y_max.is_finite() {
        y_min = 0.0;
        y_max = 1.0;
    }
    if (y_max - y_min).abs() < f64::EPSILON {
        y_min -= 0.5;
        y_max += 0.5;
    }

    let root = SVGBackend::new(path, (800, 520)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption(caption, ("sans-serif", 16))
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(1f64..(points.max(2) as f64), y_min..y_max)?;
    chart.configure_mesh().x_desc(x_desc).y_desc(y_desc).draw()?;

    for (idx, (label, values)) in series.iter().enumerate() {
        let color = COLORS[idx % COLORS.len()];
        chart
            .draw_series(LineSeries::new(
                values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| ((i + 1) as f64, *v)),
                &color,
            ))?
            .label(*label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.filled()));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

#[cfg(not(feature = "plots"))]
pub fn plot_trends(
    _dir: &Path,
    _tags: &[String],
    _epoch: usize,
    _trends: &MetricTrends,
) -> PlotResult<Vec<PathBuf>> {
    Err("plots feature is not enabled".into())
}

#[cfg(all(test, feature = "plots"))]
mod tests {
    use super::*;

    #[test]
    fn writes_three_svg_files() {
        let dir = tempfile::tempdir().unwrap();
        let trends = MetricTrends {
            train_loss: vec![2.3, 1.9],
            train_acc: vec![10.0, 30.0],
            valid_loss: vec![2.2, 2.0],
            valid_acc: vec![12.0, 25.0],
            learning_rate: vec![0.1, 0.1, 0.09, 0.09],
        };
        let tags = vec!["TinyResNet".to_string(), "lr 0.1".to_string()];
        let paths = plot_trends(dir.path(), &tags, 2, &trends).unwrap();
        assert_eq!(paths.len(), 3);
        for path in paths {
            assert!(path.is_file());
            assert!(path.to_string_lossy().ends_with("_epoch2.svg"));
        }
    }
}
