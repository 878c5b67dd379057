use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use advisory_core::Bar;
use plotters::prelude::*;
use technical_analysis::IndicatorSeries;

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("Nothing to draw: {0}")]
    Empty(String),
    #[error("Drawing failed: {0}")]
    Draw(String),
    #[error("Chart I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces the PNG attached to a notification.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, ticker: &str, bars: &[Bar], series: &IndicatorSeries) -> Result<Vec<u8>, ChartError>;
}

static CHART_SEQ: AtomicU64 = AtomicU64::new(0);

/// Three stacked panels: close with Bollinger bands, %B, and RSI with its SMA.
#[derive(Debug, Clone)]
pub struct PlottersChartRenderer {
    pub width: u32,
    pub height: u32,
}

impl Default for PlottersChartRenderer {
    fn default() -> Self {
        Self {
            width: 900,
            height: 900,
        }
    }
}

fn draw_err<E: std::fmt::Display>(e: E) -> ChartError {
    ChartError::Draw(e.to_string())
}

fn points(values: &[f64]) -> Vec<(f64, f64)> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, v)| (i as f64, *v))
        .collect()
}

/// Finite min/max over several series, padded so flat data still has height.
fn value_range<'a>(series: impl IntoIterator<Item = &'a [f64]>) -> Option<(f64, f64)> {
    let (lo, hi) = series
        .into_iter()
        .flat_map(|s| s.iter().copied())
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return None;
    }
    let pad = ((hi - lo) * 0.05).max(1e-6);
    Some((lo - pad, hi + pad))
}

impl PlottersChartRenderer {
    fn draw(
        &self,
        path: &Path,
        bars: &[Bar],
        series: &IndicatorSeries,
    ) -> Result<(), ChartError> {
        let n = series.len().max(2) as f64;
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let (price_lo, price_hi) = value_range([
            series.close.as_slice(),
            series.bb_upper.as_slice(),
            series.bb_lower.as_slice(),
            highs.as_slice(),
            lows.as_slice(),
        ])
        .ok_or_else(|| ChartError::Empty("no finite prices".to_string()))?;
        let (pb_lo, pb_hi) = value_range([series.bb_percent.as_slice(), &[0.0, 1.0][..]])
            .unwrap_or((-0.5, 1.5));

        let root = BitMapBackend::new(path, (self.width, self.height)).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;
        let panels = root.split_evenly((3, 1));

        let mut price = ChartBuilder::on(&panels[0])
            .margin(10)
            .build_cartesian_2d(0f64..n, price_lo..price_hi)
            .map_err(draw_err)?;
        price
            .draw_series(LineSeries::new(points(&series.bb_upper), &RED.mix(0.6)))
            .map_err(draw_err)?;
        price
            .draw_series(LineSeries::new(points(&series.bb_middle), &GREEN.mix(0.6)))
            .map_err(draw_err)?;
        price
            .draw_series(LineSeries::new(points(&series.bb_lower), &RED.mix(0.6)))
            .map_err(draw_err)?;
        price
            .draw_series(LineSeries::new(points(&series.close), &BLACK))
            .map_err(draw_err)?;

        let mut percent_b = ChartBuilder::on(&panels[1])
            .margin(10)
            .build_cartesian_2d(0f64..n, pb_lo..pb_hi)
            .map_err(draw_err)?;
        for level in [0.0, 1.0] {
            percent_b
                .draw_series(LineSeries::new(vec![(0.0, level), (n, level)], &BLACK.mix(0.3)))
                .map_err(draw_err)?;
        }
        percent_b
            .draw_series(LineSeries::new(points(&series.bb_percent), &BLUE))
            .map_err(draw_err)?;

        let mut rsi = ChartBuilder::on(&panels[2])
            .margin(10)
            .build_cartesian_2d(0f64..n, 0f64..100f64)
            .map_err(draw_err)?;
        for level in [30.0, 70.0] {
            rsi.draw_series(LineSeries::new(vec![(0.0, level), (n, level)], &BLACK.mix(0.3)))
                .map_err(draw_err)?;
        }
        rsi.draw_series(LineSeries::new(points(&series.rsi), &MAGENTA))
            .map_err(draw_err)?;
        rsi.draw_series(LineSeries::new(points(&series.rsi_sma), &CYAN))
            .map_err(draw_err)?;

        root.present().map_err(draw_err)?;
        Ok(())
    }
}

impl ChartRenderer for PlottersChartRenderer {
    fn render(&self, ticker: &str, bars: &[Bar], series: &IndicatorSeries) -> Result<Vec<u8>, ChartError> {
        if series.is_empty() {
            return Err(ChartError::Empty(format!("no indicator data for {}", ticker)));
        }

        let seq = CHART_SEQ.fetch_add(1, Ordering::Relaxed);
        let file_ticker: String = ticker.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let path = std::env::temp_dir().join(format!(
            "advisory-{}-{}-{}.png",
            file_ticker,
            std::process::id(),
            seq
        ));

        let drawn = self.draw(&path, bars, series);
        let png = drawn.and_then(|_| std::fs::read(&path).map_err(ChartError::from));
        let _ = std::fs::remove_file(&path);
        png
    }
}
