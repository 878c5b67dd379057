use advisory_core::{AdvisoryError, SubscriberId};
use thiserror::Error;

/// Failures of the subscription management operations.
///
/// Everything except `Internal` is a caller-facing validation failure.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Subscriber {0} is not registered")]
    NotRegistered(SubscriberId),

    #[error("Subscriber {subscriber_id} is not subscribed to {target}")]
    NotSubscribed {
        subscriber_id: SubscriberId,
        target: String,
    },

    #[error("Subscriber {subscriber_id} is already subscribed to {ticker}")]
    AlreadySubscribed {
        subscriber_id: SubscriberId,
        ticker: String,
    },

    #[error("Subscriber {subscriber_id} has reached the subscription limit of {limit}")]
    SubscriptionLimit {
        subscriber_id: SubscriberId,
        limit: usize,
    },

    #[error("Unknown instrument {0}")]
    UnknownInstrument(String),

    #[error("Invalid ticker '{0}'")]
    InvalidTicker(String),

    #[error(transparent)]
    Internal(#[from] AdvisoryError),
}

impl SubscriptionError {
    pub fn is_validation(&self) -> bool {
        !matches!(self, SubscriptionError::Internal(_))
    }
}
