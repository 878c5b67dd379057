use std::sync::Arc;

use advisory_core::{Bar, MessagingSink, State, SubscriberId, Subscription};
use serde::Serialize;
use technical_analysis::IndicatorSeries;

use crate::{AdvisoryMessage, ChartRenderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    NoRecipients,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchReport {
    fn no_recipients() -> Self {
        Self {
            outcome: DispatchOutcome::NoRecipients,
            attempted: 0,
            delivered: 0,
            failed: 0,
        }
    }
}

/// Fans one state change out to every recipient of a subscription.
pub struct NotificationDispatcher {
    sink: Arc<dyn MessagingSink>,
    renderer: Option<Arc<dyn ChartRenderer>>,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn MessagingSink>) -> Self {
        Self { sink, renderer: None }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ChartRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Deliver `state` to the subscription's active members, or to `recipients`
    /// when given. Each delivery is independent: a failure is logged and the
    /// remaining recipients are still attempted.
    pub async fn dispatch(
        &self,
        subscription: &Subscription,
        state: &State,
        bars: &[Bar],
        series: &IndicatorSeries,
        recipients: Option<&[SubscriberId]>,
    ) -> DispatchReport {
        let recipients = match recipients {
            Some(explicit) => explicit.to_vec(),
            None => subscription.active_recipients(),
        };
        if recipients.is_empty() {
            tracing::debug!("No recipients for {} ({})", subscription.ticker(), state);
            return DispatchReport::no_recipients();
        }

        let text = AdvisoryMessage::render(subscription.ticker(), state, &series.latest());
        let chart = self.render_chart(subscription.ticker(), bars, series).await;

        let mut report = DispatchReport {
            outcome: DispatchOutcome::Sent,
            attempted: 0,
            delivered: 0,
            failed: 0,
        };

        for recipient in &recipients {
            report.attempted += 1;
            match self.sink.send(recipient, &text, chart.as_deref()).await {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::info!(
                        "Sent {} advisory for {} to {} via {}",
                        state,
                        subscription.ticker(),
                        recipient,
                        self.sink.name()
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        "Failed to notify {} about {} via {}: {}",
                        recipient,
                        subscription.ticker(),
                        self.sink.name(),
                        e
                    );
                }
            }
        }

        report
    }

    async fn render_chart(&self, ticker: &str, bars: &[Bar], series: &IndicatorSeries) -> Option<Vec<u8>> {
        let renderer = self.renderer.clone()?;
        let (owned_ticker, bars, series) = (ticker.to_string(), bars.to_vec(), series.clone());

        match tokio::task::spawn_blocking(move || renderer.render(&owned_ticker, &bars, &series)).await {
            Ok(Ok(png)) => Some(png),
            Ok(Err(e)) => {
                tracing::warn!("Chart rendering failed for {}, sending text only: {}", ticker, e);
                None
            }
            Err(e) => {
                tracing::warn!("Chart task failed for {}, sending text only: {}", ticker, e);
                None
            }
        }
    }
}
