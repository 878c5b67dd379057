use advisory_core::{
    AdvisoryError, Interval, Period, State, SubscriberId, Subscription, SubscriptionId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use state_classifier::RuleTable;

use crate::SubscriptionError;

/// Narrows `list_subscriptions` to one subscriber's memberships.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFilter {
    pub subscriber_id: Option<SubscriberId>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn subscriber(subscriber_id: SubscriberId) -> Self {
        Self {
            subscriber_id: Some(subscriber_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub subscriber_id: SubscriberId,
    pub ticker: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub period: Period,
    #[serde(default)]
    pub interval: Interval,
}

/// Configuration shared by the store adapters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub subscriptions_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:advisory.db".to_string(),
            subscriptions_limit: 5,
        }
    }
}

impl StoreConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.database_url),
            subscriptions_limit: std::env::var("SUBSCRIPTIONS_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.subscriptions_limit),
        }
    }
}

/// Upper-cased ticker, or `InvalidTicker` when it cannot be a symbol.
pub fn normalize_ticker(ticker: &str) -> Result<String, SubscriptionError> {
    let ticker = ticker.trim().to_ascii_uppercase();
    let valid = !ticker.is_empty()
        && ticker.len() <= 10
        && ticker
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
    if valid {
        Ok(ticker)
    } else {
        Err(SubscriptionError::InvalidTicker(ticker))
    }
}

/// Persistent view of instruments, subscriptions and their advisory states.
///
/// `compare_and_set_state` is the only way a subscription's state changes.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Subscriptions ordered by id, each with its full member list.
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, AdvisoryError>;

    /// Atomically replace the state if it still equals `expected`.
    ///
    /// Fails with `AdvisoryError::Conflict` when another writer got there
    /// first, and with `AdvisoryError::NotFound` for an unknown subscription.
    async fn compare_and_set_state(
        &self,
        subscription_id: SubscriptionId,
        expected: &State,
        new_state: &State,
    ) -> Result<(), AdvisoryError>;

    async fn fallback_state(&self) -> Result<State, AdvisoryError>;

    async fn rule_table(&self) -> Result<RuleTable, AdvisoryError>;

    async fn register_subscriber(&self, subscriber_id: &SubscriberId) -> Result<(), AdvisoryError>;

    /// Get-or-create the instrument and subscription, then add the member.
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription, SubscriptionError>;

    /// Remove the member from every subscription of `ticker`.
    async fn unsubscribe(
        &self,
        subscriber_id: &SubscriberId,
        ticker: &str,
    ) -> Result<(), SubscriptionError>;

    async fn set_notifications(
        &self,
        subscriber_id: &SubscriberId,
        subscription_id: SubscriptionId,
        active: bool,
    ) -> Result<(), SubscriptionError>;
}
