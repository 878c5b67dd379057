//! Indicator math over close prices.
//!
//! Every function returns a series aligned with its input: same length, with
//! `NaN` wherever there is not yet enough history for a value.

/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    let mut result = vec![f64::NAN; data.len()];
    if period == 0 || data.len() < period {
        return result;
    }

    for i in period - 1..data.len() {
        let window = &data[i + 1 - period..=i];
        if window.iter().all(|v| v.is_finite()) {
            result[i] = window.iter().sum::<f64>() / period as f64;
        }
    }
    result
}

/// Rolling sample standard deviation (divisor `period - 1`).
pub fn rolling_std(data: &[f64], period: usize) -> Vec<f64> {
    let mut result = vec![f64::NAN; data.len()];
    if period < 2 || data.len() < period {
        return result;
    }

    for i in period - 1..data.len() {
        let window = &data[i + 1 - period..=i];
        if !window.iter().all(|v| v.is_finite()) {
            continue;
        }
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (period - 1) as f64;
        result[i] = variance.sqrt();
    }
    result
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    // No losses in the window: RS is undefined and RSI saturates.
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Relative Strength Index with Wilder smoothing (factor `1/period`).
///
/// The running averages are seeded with the plain mean of the first `period`
/// price changes, so the first defined value sits at index `period`.
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    let mut result = vec![f64::NAN; data.len()];
    if period == 0 || data.len() < period + 1 {
        return result;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = data[i] - data[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss += change.abs();
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    result[period] = rsi_value(avg_gain, avg_loss);

    let alpha = 1.0 / period as f64;
    for i in period + 1..data.len() {
        let change = data[i] - data[i - 1];
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, change.abs()) };

        avg_gain += alpha * (gain - avg_gain);
        avg_loss += alpha * (loss - avg_loss);
        result[i] = rsi_value(avg_gain, avg_loss);
    }

    result
}

/// Bollinger Bands
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger_bands(data: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    let middle = sma(data, period);
    let deviation = rolling_std(data, period);

    let upper = middle
        .iter()
        .zip(&deviation)
        .map(|(m, d)| m + std_dev * d)
        .collect();
    let lower = middle
        .iter()
        .zip(&deviation)
        .map(|(m, d)| m - std_dev * d)
        .collect();

    BollingerBands {
        upper,
        middle,
        lower,
    }
}

/// Position of each close inside its bands: 0 at the lower band, 1 at the upper.
/// Undefined (`NaN`) when the bands collapse onto each other.
pub fn percent_b(data: &[f64], bands: &BollingerBands) -> Vec<f64> {
    data.iter()
        .zip(bands.lower.iter().zip(&bands.upper))
        .map(|(close, (lower, upper))| {
            let width = upper - lower;
            if !width.is_finite() || width == 0.0 {
                f64::NAN
            } else {
                (close - lower) / width
            }
        })
        .collect()
}
