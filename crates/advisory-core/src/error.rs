use thiserror::Error;

use crate::SubscriptionId;

#[derive(Error, Debug)]
pub enum AdvisoryError {
    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Insufficient data: need {required} bars, got {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("State conflict on subscription {subscription_id}: expected {expected}, found {actual}")]
    Conflict {
        subscription_id: SubscriptionId,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid rules: {0}")]
    InvalidRules(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AdvisoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, AdvisoryError::Conflict { .. })
    }
}

/// Outcome of a single push to a messaging sink.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Recipient invalid: {0}")]
    RecipientInvalid(String),

    #[error("Transient delivery failure: {0}")]
    Transient(String),
}
