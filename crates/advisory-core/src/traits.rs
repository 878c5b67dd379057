use async_trait::async_trait;

use crate::{AdvisoryError, Bar, DeliveryError, Interval, Period, SubscriberId};

/// Source of historical price bars for an instrument.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Bars ascending by timestamp. An empty vector means the ticker has no data.
    async fn fetch_history(
        &self,
        ticker: &str,
        period: &Period,
        interval: &Interval,
    ) -> Result<Vec<Bar>, AdvisoryError>;

    fn name(&self) -> &str;
}

/// Push-message sink that accepts text with an optional image.
#[async_trait]
pub trait MessagingSink: Send + Sync {
    async fn send(
        &self,
        recipient: &SubscriberId,
        text: &str,
        image: Option<&[u8]>,
    ) -> Result<(), DeliveryError>;

    fn name(&self) -> &str;
}
