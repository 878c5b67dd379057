use std::collections::BTreeMap;

use advisory_core::{indicators, AdvisoryError, Bar};
use serde::{Deserialize, Serialize};

use crate::indicators::*;

/// Window sizes for the indicators computed on every run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub rsi_ma_period: usize,
    pub bb_window: usize,
    pub bb_std_dev: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_ma_period: 14,
            bb_window: 20,
            bb_std_dev: 2.0,
        }
    }
}

impl IndicatorConfig {
    /// Load from environment variables, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rsi_period: env_or("RSI_PERIOD", defaults.rsi_period),
            rsi_ma_period: env_or("RSI_MA_PERIOD", defaults.rsi_ma_period),
            bb_window: env_or("BBANDS_WINDOW", defaults.bb_window),
            bb_std_dev: env_or("BBANDS_STD_DEV", defaults.bb_std_dev),
        }
    }

    /// Shortest series for which every latest indicator value is defined.
    pub fn min_bars(&self) -> usize {
        self.bb_window.max(self.rsi_period + self.rsi_ma_period)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Indicator series aligned with the input bars.
#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    pub close: Vec<f64>,
    pub rsi: Vec<f64>,
    pub rsi_sma: Vec<f64>,
    pub bb_lower: Vec<f64>,
    pub bb_middle: Vec<f64>,
    pub bb_upper: Vec<f64>,
    pub bb_percent: Vec<f64>,
}

impl IndicatorSeries {
    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// Values at the most recent bar.
    pub fn latest(&self) -> IndicatorSnapshot {
        let last = |values: &[f64]| values.last().copied().unwrap_or(f64::NAN);
        IndicatorSnapshot {
            close: last(&self.close),
            rsi: last(&self.rsi),
            rsi_sma: last(&self.rsi_sma),
            bb_percent: last(&self.bb_percent),
        }
    }
}

/// Latest indicator readings for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub rsi: f64,
    pub rsi_sma: f64,
    pub bb_percent: f64,
}

impl IndicatorSnapshot {
    /// Indicator name -> value, for the readings that are defined.
    pub fn values(&self) -> BTreeMap<String, f64> {
        [
            (indicators::RSI, self.rsi),
            (indicators::RSI_SMA, self.rsi_sma),
            (indicators::BBANDS_PERCENT, self.bb_percent),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_finite())
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }

    /// Compute every indicator over `bars` (ascending by timestamp).
    pub fn compute(&self, bars: &[Bar]) -> Result<IndicatorSeries, AdvisoryError> {
        let required = self.config.min_bars().max(1);
        if bars.len() < required {
            return Err(AdvisoryError::InsufficientData {
                required,
                available: bars.len(),
            });
        }

        let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let rsi_values = rsi(&close, self.config.rsi_period);
        let rsi_sma = sma(&rsi_values, self.config.rsi_ma_period);
        let bands = bollinger_bands(&close, self.config.bb_window, self.config.bb_std_dev);
        let bb_percent = percent_b(&close, &bands);

        Ok(IndicatorSeries {
            close,
            rsi: rsi_values,
            rsi_sma,
            bb_lower: bands.lower,
            bb_middle: bands.middle,
            bb_upper: bands.upper,
            bb_percent,
        })
    }
}
