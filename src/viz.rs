//! SVG charts of a pipeline report using Plotters

use std::path::{Path, PathBuf};

use plotters::prelude::*;

use crate::forecast::PortfolioForecast;
use crate::pipeline::PipelineReport;
use crate::segment::TierCounts;

/// Low, Medium, High
const TIER_COLORS: [RGBColor; 3] = [GREEN, BLUE, RED];

pub const FORECAST_CHART: &str = "forecast.svg";
pub const TIER_CHART: &str = "tiers.svg";

/// Monthly portfolio spend followed by the forecast months
///
/// # Arguments
/// * `forecast` - Portfolio forecast, including the observed history
/// * `output_path` - Path of the SVG file to write
pub fn create_forecast_chart(forecast: &PortfolioForecast, output_path: &Path) -> crate::Result<()> {
    let history = &forecast.history;
    let n_hist = history.len();
    let total = n_hist + forecast.points.len();

    let labels: Vec<String> = history
        .months
        .iter()
        .chain(&forecast.months)
        .map(|m| m.to_string())
        .collect();

    let y_max = history
        .values
        .iter()
        .chain(&forecast.points)
        .fold(0.0f64, |a, &b| a.max(b));
    let y_max = if y_max > 0.0 { y_max * 1.1 } else { 1.0 };

    let root = SVGBackend::new(output_path, (900, 500)).into_drawing_area();
    root.fill(&WHITE)?;

    let title = format!(
        "Monthly portfolio spend: {}{}",
        forecast.order,
        if forecast.seasonal_used { " seasonal" } else { "" }
    );
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(80)
        .build_cartesian_2d(0f64..(total.max(1) as f64), 0f64..y_max)?;

    chart
        .configure_mesh()
        .x_desc("Month")
        .y_desc("Total spend")
        .x_label_formatter(&|x| {
            labels
                .get(x.round().max(0.0) as usize)
                .cloned()
                .unwrap_or_default()
        })
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            history.values.iter().enumerate().map(|(i, &v)| (i as f64, v)),
            &BLUE,
        ))?
        .label("Observed")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));

    // the forecast line starts from the last observed month
    let anchor = history.values.last().map(|&v| ((n_hist - 1) as f64, v));
    let future: Vec<(f64, f64)> = forecast
        .points
        .iter()
        .enumerate()
        .map(|(i, &v)| ((n_hist + i) as f64, v))
        .collect();

    chart
        .draw_series(LineSeries::new(anchor.into_iter().chain(future.iter().copied()), &RED))?
        .label("Forecast")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    chart.draw_series(future.iter().map(|&p| Circle::new(p, 4, RED.filled())))?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;
    log::info!("Forecast chart saved to: {}", output_path.display());

    Ok(())
}

/// Bar chart of accounts per tier
pub fn create_tier_chart(counts: &TierCounts, output_path: &Path) -> crate::Result<()> {
    let bars = [("Low", counts.low), ("Medium", counts.medium), ("High", counts.high)];
    let max_count = bars.iter().map(|(_, c)| *c).max().unwrap_or(0).max(1) as f64;

    let root = SVGBackend::new(output_path, (600, 400)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Accounts per Spend Tier", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(-0.5f64..2.5f64, 0f64..(max_count * 1.1))?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(3)
        .x_label_formatter(&|x| {
            bars.get(x.round().max(0.0) as usize)
                .map(|(name, _)| name.to_string())
                .unwrap_or_default()
        })
        .y_desc("Accounts")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    for (i, (_, count)) in bars.iter().enumerate() {
        chart.draw_series(std::iter::once(Rectangle::new(
            [(i as f64 - 0.35, 0.0), (i as f64 + 0.35, *count as f64)],
            TIER_COLORS[i].filled(),
        )))?;
    }

    root.present()?;
    log::info!("Tier chart saved to: {}", output_path.display());

    Ok(())
}

/// Write both charts into `output_dir`
pub fn generate_charts(report: &PipelineReport, output_dir: &Path) -> crate::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir)?;

    let forecast_path = output_dir.join(FORECAST_CHART);
    create_forecast_chart(&report.forecast, &forecast_path)?;

    let tier_path = output_dir.join(TIER_CHART);
    create_tier_chart(&report.tier_counts, &tier_path)?;

    Ok(vec![forecast_path, tier_path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{MonthlySeries, YearMonth};
    use crate::forecast::ArimaOrder;
    use tempfile::tempdir;

    fn forecast() -> PortfolioForecast {
        let months: Vec<YearMonth> = (1..=6).map(|m| YearMonth::new(2024, m)).collect();
        PortfolioForecast {
            order: ArimaOrder::new(1, 1, 0),
            seasonal_used: false,
            aic: 1.0,
            history: MonthlySeries {
                months,
                values: vec![100.0, 120.0, 90.0, 130.0, 125.0, 140.0],
            },
            months: vec![YearMonth::new(2024, 7), YearMonth::new(2024, 8)],
            points: vec![145.0, 150.0],
            holdout: None,
        }
    }

    #[test]
    fn test_create_forecast_chart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FORECAST_CHART);

        create_forecast_chart(&forecast(), &path).unwrap();

        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn test_create_tier_chart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TIER_CHART);
        let counts = TierCounts {
            low: 10,
            medium: 4,
            high: 1,
        };

        create_tier_chart(&counts, &path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_tier_chart_with_no_accounts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TIER_CHART);

        create_tier_chart(&TierCounts::default(), &path).unwrap();

        assert!(path.exists());
    }
}
