#[cfg(test)]
mod tests {
    use super::super::engine::*;
    use super::super::indicators::*;
    use advisory_core::{indicators, AdvisoryError, Bar};
    use chrono::{TimeZone, Utc};

    // Helper function to create sample price data
    fn sample_prices() -> Vec<f64> {
        vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ]
    }

    // Helper function to create daily bars from closes
    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: start + chrono::Duration::days(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000_000.0,
            })
            .collect()
    }

    fn wave(len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1)
            .collect()
    }

    #[test]
    fn test_sma_is_aligned_with_input() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&data, 3);

        assert_eq!(result.len(), data.len());
        assert!(result[0].is_nan());
        assert!(result[1].is_nan());
        assert!((result[2] - 2.0).abs() < 0.001); // (1+2+3)/3 = 2
        assert!((result[3] - 3.0).abs() < 0.001);
        assert!((result[4] - 4.0).abs() < 0.001);
    }

    #[test]
    fn test_sma_insufficient_data() {
        let data = vec![1.0, 2.0];
        let result = sma(&data, 5);

        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_sma_skips_windows_with_nan() {
        let data = vec![f64::NAN, 2.0, 4.0, 6.0];
        let result = sma(&data, 2);

        assert!(result[1].is_nan());
        assert!((result[2] - 3.0).abs() < 0.001);
        assert!((result[3] - 5.0).abs() < 0.001);
    }

    #[test]
    fn test_rolling_std_uses_sample_deviation() {
        let data = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let result = rolling_std(&data, 8);

        // Squared deviations sum to 32, divided by n-1 = 7
        let expected = (32.0_f64 / 7.0).sqrt();
        assert!((result[7] - expected).abs() < 1e-9);
        assert!(result[6].is_nan());
    }

    #[test]
    fn test_rsi_warm_up_and_range() {
        let prices = sample_prices();
        let result = rsi(&prices, 14);

        assert_eq!(result.len(), prices.len());
        assert!(result[..14].iter().all(|v| v.is_nan()));
        for &value in &result[14..] {
            assert!((0.0..=100.0).contains(&value));
        }
    }

    #[test]
    fn test_rsi_wilder_smoothing() {
        // changes: +1, -1, +2
        let data = vec![10.0, 11.0, 10.0, 12.0];
        let result = rsi(&data, 2);

        // Seed: avg_gain = 0.5, avg_loss = 0.5
        assert!((result[2] - 50.0).abs() < 1e-9);
        // avg_gain = 1.25, avg_loss = 0.25, RS = 5
        assert!((result[3] - (100.0 - 100.0 / 6.0)).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_no_losses_is_100() {
        let data: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let result = rsi(&data, 14);

        for &value in &result[14..] {
            assert_eq!(value, 100.0);
        }
    }

    #[test]
    fn test_rsi_flat_prices_is_100() {
        let data = vec![50.0; 20];
        let result = rsi(&data, 14);
        assert_eq!(result[19], 100.0);
    }

    #[test]
    fn test_rsi_downtrend_is_zero() {
        let data: Vec<f64> = (1..=30).rev().map(|i| i as f64).collect();
        let result = rsi(&data, 14);
        assert!(result[29].abs() < 1e-9);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let result = rsi(&[1.0, 2.0, 3.0], 14);
        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_percent_b_position_inside_bands() {
        let data = vec![1.0, 2.0, 3.0];
        let bands = bollinger_bands(&data, 3, 2.0);

        // mean 2, sample std 1 -> bands [0, 4]
        assert!((bands.lower[2] - 0.0).abs() < 1e-9);
        assert!((bands.upper[2] - 4.0).abs() < 1e-9);

        let pb = percent_b(&data, &bands);
        assert!(pb[0].is_nan());
        assert!((pb[2] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_percent_b_undefined_for_flat_prices() {
        let data = vec![10.0; 25];
        let bands = bollinger_bands(&data, 20, 2.0);
        let pb = percent_b(&data, &bands);

        assert!(pb.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_engine_requires_longest_window() {
        let engine = IndicatorEngine::default();
        assert_eq!(engine.config().min_bars(), 28);

        let bars = bars_from_closes(&wave(27));
        match engine.compute(&bars) {
            Err(AdvisoryError::InsufficientData { required, available }) => {
                assert_eq!(required, 28);
                assert_eq!(available, 27);
            }
            other => panic!("expected insufficient data, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_engine_rejects_empty_series() {
        let engine = IndicatorEngine::default();
        assert!(matches!(
            engine.compute(&[]),
            Err(AdvisoryError::InsufficientData { available: 0, .. })
        ));
    }

    #[test]
    fn test_engine_latest_snapshot() {
        let engine = IndicatorEngine::default();
        let closes = wave(60);
        let series = engine.compute(&bars_from_closes(&closes)).unwrap();

        assert_eq!(series.len(), 60);
        assert_eq!(series.rsi.len(), 60);
        assert_eq!(series.bb_percent.len(), 60);

        let snapshot = series.latest();
        assert_eq!(snapshot.close, closes[59]);
        assert!(snapshot.rsi.is_finite());
        assert!(snapshot.rsi_sma.is_finite());
        assert!(snapshot.bb_percent.is_finite());

        let values = snapshot.values();
        assert_eq!(values.len(), 3);
        assert_eq!(values[indicators::RSI], snapshot.rsi);
        assert_eq!(values[indicators::BBANDS_PERCENT], snapshot.bb_percent);
    }

    #[test]
    fn test_snapshot_values_omit_undefined_readings() {
        let engine = IndicatorEngine::default();
        let series = engine.compute(&bars_from_closes(&[42.0; 30])).unwrap();
        let values = series.latest().values();

        assert!(!values.contains_key(indicators::BBANDS_PERCENT));
        assert_eq!(values[indicators::RSI], 100.0);
    }
}
