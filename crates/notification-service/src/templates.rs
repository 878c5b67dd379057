use advisory_core::State;
use technical_analysis::IndicatorSnapshot;

pub struct AdvisoryMessage;

impl AdvisoryMessage {
    pub fn render(ticker: &str, state: &State, snapshot: &IndicatorSnapshot) -> String {
        format!(
            "It is a good time to {} {}.\nClose: {}\nRSI: {}, RSI SMA14: {}\nBBands%: {}",
            state.name,
            ticker,
            format_value(snapshot.close),
            format_value(snapshot.rsi),
            format_value(snapshot.rsi_sma),
            format_value(snapshot.bb_percent),
        )
    }
}

fn format_value(value: f64) -> String {
    if value.is_finite() {
        format!("{:.2}", value)
    } else {
        "n/a".to_string()
    }
}
