use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Interval, Period};

pub type InstrumentId = i64;
pub type SubscriptionId = i64;
pub type StateId = i64;

/// Indicator names used to key threshold rules.
pub mod indicators {
    pub const RSI: &str = "RSI";
    pub const RSI_SMA: &str = "RSI_SMA14";
    pub const BBANDS_PERCENT: &str = "BBands%";
}

/// OHLCV bar data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Opaque subscriber identity (a chat id for the Telegram sink).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SubscriberId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A tracked ticker symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub ticker: String,
    pub name: String,
}

/// Named signal used to key threshold rules. Carries no numeric range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Advisory label such as "Buy" or "Strong Sell".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Lower values win when several states match at once.
    #[serde(default)]
    pub priority: i32,
}

impl State {
    pub fn new(id: StateId, name: impl Into<String>, description: impl Into<String>, priority: i32) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            priority,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Membership of one subscriber in one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub subscriber_id: SubscriberId,
    pub notifications_active: bool,
}

/// One polling configuration shared by all of its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub instrument: Instrument,
    pub period: Period,
    pub interval: Interval,
    pub state: State,
    pub members: Vec<Member>,
}

impl Subscription {
    /// Members that currently accept notifications, in membership order.
    pub fn active_recipients(&self) -> Vec<SubscriberId> {
        self.members
            .iter()
            .filter(|m| m.notifications_active)
            .map(|m| m.subscriber_id.clone())
            .collect()
    }

    pub fn has_member(&self, subscriber_id: &SubscriberId) -> bool {
        self.members.iter().any(|m| &m.subscriber_id == subscriber_id)
    }

    pub fn ticker(&self) -> &str {
        &self.instrument.ticker
    }
}
