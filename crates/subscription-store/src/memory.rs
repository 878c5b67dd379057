use std::collections::{BTreeMap, BTreeSet};

use advisory_core::{
    AdvisoryError, Instrument, InstrumentId, Interval, Member, Period, State, StateId,
    SubscriberId, Subscription, SubscriptionId,
};
use async_trait::async_trait;
use state_classifier::RuleTable;
use tokio::sync::RwLock;

use crate::store::normalize_ticker;
use crate::{SubscribeRequest, SubscriptionError, SubscriptionFilter, SubscriptionStore};

struct SubscriptionRecord {
    instrument_id: InstrumentId,
    period: Period,
    interval: Interval,
    state_id: StateId,
    members: Vec<Member>,
}

#[derive(Default)]
struct Inner {
    subscribers: BTreeSet<SubscriberId>,
    instruments: BTreeMap<InstrumentId, Instrument>,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionRecord>,
    next_instrument_id: InstrumentId,
    next_subscription_id: SubscriptionId,
}

impl Inner {
    fn instrument_by_ticker(&self, ticker: &str) -> Option<&Instrument> {
        self.instruments.values().find(|i| i.ticker == ticker)
    }

    fn memberships(&self, subscriber_id: &SubscriberId) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.members.iter().any(|m| &m.subscriber_id == subscriber_id))
            .count()
    }
}

/// Process-local store backed by ordered maps behind a tokio `RwLock`.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    rules: RuleTable,
    subscriptions_limit: usize,
}

impl InMemoryStore {
    pub fn new(rules: RuleTable, subscriptions_limit: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_instrument_id: 1,
                next_subscription_id: 1,
                ..Default::default()
            }),
            rules,
            subscriptions_limit,
        }
    }

    fn state(&self, id: StateId) -> Result<State, AdvisoryError> {
        self.rules
            .state(id)
            .cloned()
            .ok_or_else(|| AdvisoryError::NotFound(format!("state {}", id)))
    }

    fn materialize(
        &self,
        inner: &Inner,
        id: SubscriptionId,
        record: &SubscriptionRecord,
    ) -> Result<Subscription, AdvisoryError> {
        let instrument = inner
            .instruments
            .get(&record.instrument_id)
            .cloned()
            .ok_or_else(|| AdvisoryError::NotFound(format!("instrument {}", record.instrument_id)))?;

        Ok(Subscription {
            id,
            instrument,
            period: record.period,
            interval: record.interval,
            state: self.state(record.state_id)?,
            members: record.members.clone(),
        })
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, AdvisoryError> {
        let inner = self.inner.read().await;
        inner
            .subscriptions
            .iter()
            .filter(|(_, record)| match &filter.subscriber_id {
                Some(subscriber_id) => record.members.iter().any(|m| &m.subscriber_id == subscriber_id),
                None => true,
            })
            .map(|(id, record)| self.materialize(&inner, *id, record))
            .collect()
    }

    async fn compare_and_set_state(
        &self,
        subscription_id: SubscriptionId,
        expected: &State,
        new_state: &State,
    ) -> Result<(), AdvisoryError> {
        // Validate before taking the write lock
        self.state(new_state.id)?;

        let mut inner = self.inner.write().await;
        let record = inner
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or_else(|| AdvisoryError::NotFound(format!("subscription {}", subscription_id)))?;

        if record.state_id != expected.id {
            let actual = self
                .rules
                .state(record.state_id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| record.state_id.to_string());
            return Err(AdvisoryError::Conflict {
                subscription_id,
                expected: expected.name.clone(),
                actual,
            });
        }

        record.state_id = new_state.id;
        Ok(())
    }

    async fn fallback_state(&self) -> Result<State, AdvisoryError> {
        Ok(self.rules.fallback().clone())
    }

    async fn rule_table(&self) -> Result<RuleTable, AdvisoryError> {
        Ok(self.rules.clone())
    }

    async fn register_subscriber(&self, subscriber_id: &SubscriberId) -> Result<(), AdvisoryError> {
        self.inner.write().await.subscribers.insert(subscriber_id.clone());
        Ok(())
    }

    async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription, SubscriptionError> {
        let ticker = normalize_ticker(&request.ticker)?;
        let fallback_id = self.rules.fallback().id;
        let subscriber_id = &request.subscriber_id;

        let mut inner = self.inner.write().await;
        if !inner.subscribers.contains(subscriber_id) {
            return Err(SubscriptionError::NotRegistered(subscriber_id.clone()));
        }

        let existing = inner.instrument_by_ticker(&ticker).map(|i| i.id);
        let subscription_id = existing.and_then(|instrument_id| {
            inner
                .subscriptions
                .iter()
                .find(|(_, s)| {
                    s.instrument_id == instrument_id
                        && s.period == request.period
                        && s.interval == request.interval
                })
                .map(|(id, _)| *id)
        });

        if let Some(id) = subscription_id {
            let limit_reached = inner.memberships(subscriber_id) >= self.subscriptions_limit;
            if let Some(record) = inner.subscriptions.get_mut(&id) {
                match record.members.iter_mut().find(|m| &m.subscriber_id == subscriber_id) {
                    Some(member) if member.notifications_active => {
                        return Err(SubscriptionError::AlreadySubscribed {
                            subscriber_id: subscriber_id.clone(),
                            ticker,
                        });
                    }
                    Some(member) => member.notifications_active = true,
                    None if limit_reached => {
                        return Err(SubscriptionError::SubscriptionLimit {
                            subscriber_id: subscriber_id.clone(),
                            limit: self.subscriptions_limit,
                        });
                    }
                    None => record.members.push(Member {
                        subscriber_id: subscriber_id.clone(),
                        notifications_active: true,
                    }),
                }
            }
            let record = &inner.subscriptions[&id];
            return Ok(self.materialize(&inner, id, record)?);
        }

        if inner.memberships(subscriber_id) >= self.subscriptions_limit {
            return Err(SubscriptionError::SubscriptionLimit {
                subscriber_id: subscriber_id.clone(),
                limit: self.subscriptions_limit,
            });
        }

        let instrument_id = match existing {
            Some(id) => id,
            None => {
                let id = inner.next_instrument_id;
                inner.next_instrument_id += 1;
                let name = if request.name.trim().is_empty() {
                    ticker.clone()
                } else {
                    request.name.trim().to_string()
                };
                inner.instruments.insert(id, Instrument { id, ticker: ticker.clone(), name });
                tracing::info!("Tracking new instrument {}", ticker);
                id
            }
        };

        let id = inner.next_subscription_id;
        inner.next_subscription_id += 1;
        inner.subscriptions.insert(
            id,
            SubscriptionRecord {
                instrument_id,
                period: request.period,
                interval: request.interval,
                state_id: fallback_id,
                members: vec![Member {
                    subscriber_id: subscriber_id.clone(),
                    notifications_active: true,
                }],
            },
        );
        tracing::info!(
            "Created subscription {} for {} ({} / {})",
            id,
            ticker,
            request.period,
            request.interval
        );

        let record = &inner.subscriptions[&id];
        Ok(self.materialize(&inner, id, record)?)
    }

    async fn unsubscribe(
        &self,
        subscriber_id: &SubscriberId,
        ticker: &str,
    ) -> Result<(), SubscriptionError> {
        let ticker = normalize_ticker(ticker)?;
        let mut inner = self.inner.write().await;
        if !inner.subscribers.contains(subscriber_id) {
            return Err(SubscriptionError::NotRegistered(subscriber_id.clone()));
        }

        let instrument_id = inner
            .instrument_by_ticker(&ticker)
            .map(|i| i.id)
            .ok_or_else(|| SubscriptionError::UnknownInstrument(ticker.clone()))?;

        let mut removed = 0;
        for record in inner
            .subscriptions
            .values_mut()
            .filter(|s| s.instrument_id == instrument_id)
        {
            let before = record.members.len();
            record.members.retain(|m| &m.subscriber_id != subscriber_id);
            removed += before - record.members.len();
        }

        if removed == 0 {
            return Err(SubscriptionError::NotSubscribed {
                subscriber_id: subscriber_id.clone(),
                target: ticker,
            });
        }
        Ok(())
    }

    async fn set_notifications(
        &self,
        subscriber_id: &SubscriberId,
        subscription_id: SubscriptionId,
        active: bool,
    ) -> Result<(), SubscriptionError> {
        let mut inner = self.inner.write().await;
        if !inner.subscribers.contains(subscriber_id) {
            return Err(SubscriptionError::NotRegistered(subscriber_id.clone()));
        }

        let member = inner
            .subscriptions
            .get_mut(&subscription_id)
            .and_then(|s| s.members.iter_mut().find(|m| &m.subscriber_id == subscriber_id))
            .ok_or_else(|| SubscriptionError::NotSubscribed {
                subscriber_id: subscriber_id.clone(),
                target: format!("subscription {}", subscription_id),
            })?;
        member.notifications_active = active;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::new(RuleTable::standard(), 5)
    }

    fn request(subscriber: &str, ticker: &str) -> SubscribeRequest {
        SubscribeRequest {
            subscriber_id: subscriber.into(),
            ticker: ticker.to_string(),
            name: String::new(),
            period: Period::default(),
            interval: Interval::default(),
        }
    }

    async fn registered(ids: &[&str]) -> InMemoryStore {
        let store = store();
        for id in ids {
            store.register_subscriber(&(*id).into()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_subscribe_creates_subscription_in_fallback_state() {
        let store = registered(&["1"]).await;
        let sub = store.subscribe(&request("1", "aapl")).await.unwrap();

        assert_eq!(sub.ticker(), "AAPL");
        assert_eq!(sub.instrument.name, "AAPL");
        assert_eq!(sub.state.name, "Hold");
        assert_eq!(sub.members.len(), 1);
        assert!(sub.members[0].notifications_active);
    }

    #[tokio::test]
    async fn test_same_cadence_shares_one_subscription() {
        let store = registered(&["1", "2"]).await;
        let a = store.subscribe(&request("1", "AAPL")).await.unwrap();
        let b = store.subscribe(&request("2", "AAPL")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.members.len(), 2);

        let mut hourly = request("2", "AAPL");
        hourly.interval = "1h".parse().unwrap();
        let c = store.subscribe(&hourly).await.unwrap();
        assert_ne!(c.id, a.id);
        assert_eq!(c.instrument.id, a.instrument.id);
    }

    #[tokio::test]
    async fn test_subscribe_validation_errors() {
        let store = registered(&["1"]).await;

        let err = store.subscribe(&request("9", "AAPL")).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NotRegistered(_)));

        store.subscribe(&request("1", "AAPL")).await.unwrap();
        let err = store.subscribe(&request("1", "AAPL")).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::AlreadySubscribed { .. }));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let store = InMemoryStore::new(RuleTable::standard(), 2);
        store.register_subscriber(&"1".into()).await.unwrap();
        store.subscribe(&request("1", "AAPL")).await.unwrap();
        store.subscribe(&request("1", "MSFT")).await.unwrap();

        let err = store.subscribe(&request("1", "NVDA")).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::SubscriptionLimit { limit: 2, .. }));
        // No instrument is left behind for the rejected request
        let all = store.list_subscriptions(&SubscriptionFilter::all()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_list_filters_by_subscriber() {
        let store = registered(&["1", "2"]).await;
        store.subscribe(&request("1", "AAPL")).await.unwrap();
        store.subscribe(&request("2", "MSFT")).await.unwrap();
        store.subscribe(&request("2", "AAPL")).await.unwrap();

        let all = store.list_subscriptions(&SubscriptionFilter::all()).await.unwrap();
        assert_eq!(all.len(), 2);

        let mine = store
            .list_subscriptions(&SubscriptionFilter::subscriber("1".into()))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].ticker(), "AAPL");
        // Full membership is returned, not just the filtering subscriber
        assert_eq!(mine[0].members.len(), 2);
    }

    #[tokio::test]
    async fn test_compare_and_set_state() {
        let store = registered(&["1"]).await;
        let sub = store.subscribe(&request("1", "AAPL")).await.unwrap();
        let table = store.rule_table().await.unwrap();
        let hold = table.state_by_name("Hold").unwrap().clone();
        let buy = table.state_by_name("Buy").unwrap().clone();
        let sell = table.state_by_name("Sell").unwrap().clone();

        store.compare_and_set_state(sub.id, &hold, &buy).await.unwrap();

        // Stale expectation never overwrites the newer state
        let err = store.compare_and_set_state(sub.id, &hold, &sell).await.unwrap_err();
        assert!(err.is_conflict());
        let current = store.list_subscriptions(&SubscriptionFilter::all()).await.unwrap();
        assert_eq!(current[0].state.name, "Buy");

        let err = store.compare_and_set_state(99, &hold, &buy).await.unwrap_err();
        assert!(matches!(err, AdvisoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_compare_and_set_has_one_winner() {
        let store = std::sync::Arc::new(registered(&["1"]).await);
        let sub = store.subscribe(&request("1", "AAPL")).await.unwrap();
        let table = store.rule_table().await.unwrap();
        let hold = table.fallback().clone();
        let buy = table.state_by_name("Buy").unwrap().clone();
        let id = sub.id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let (hold, buy) = (hold.clone(), buy.clone());
            handles.push(tokio::spawn(async move {
                store.compare_and_set_state(id, &hold, &buy).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_subscription() {
        let store = registered(&["1", "2"]).await;
        store.subscribe(&request("1", "AAPL")).await.unwrap();

        let err = store.unsubscribe(&"1".into(), "MSFT").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::UnknownInstrument(_)));
        let err = store.unsubscribe(&"2".into(), "AAPL").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NotSubscribed { .. }));

        store.unsubscribe(&"1".into(), "aapl").await.unwrap();
        let all = store.list_subscriptions(&SubscriptionFilter::all()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].members.is_empty());
    }

    #[tokio::test]
    async fn test_paused_member_is_reactivated_on_subscribe() {
        let store = registered(&["1"]).await;
        let sub = store.subscribe(&request("1", "AAPL")).await.unwrap();

        store.set_notifications(&"1".into(), sub.id, false).await.unwrap();
        let paused = store.list_subscriptions(&SubscriptionFilter::all()).await.unwrap();
        assert!(paused[0].active_recipients().is_empty());

        let resumed = store.subscribe(&request("1", "AAPL")).await.unwrap();
        assert!(resumed.members[0].notifications_active);

        let err = store.set_notifications(&"1".into(), 42, true).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::NotSubscribed { .. }));
    }
}
