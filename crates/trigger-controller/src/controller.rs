use std::sync::Arc;

use advisory_core::{AdvisoryError, PriceSource, State, SubscriberId, Subscription};
use notification_service::NotificationDispatcher;
use serde::Serialize;
use state_classifier::{classify, RuleTable};
use subscription_store::{SubscriptionFilter, SubscriptionStore};
use technical_analysis::IndicatorEngine;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const NO_ACTIVE_SUBSCRIPTIONS: &str = "No active subscriptions";
pub const SUCCESS: &str = "success";

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Subscriptions evaluated at the same time.
    pub max_concurrency: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

impl TriggerConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_concurrency: std::env::var("TRIGGER_MAX_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(Self::default().max_concurrency),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Batch,
    OnDemand,
}

/// Counts for one trigger run. Per-candidate failures only show up here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerSummary {
    pub mode: TriggerMode,
    pub message: String,
    pub candidates: usize,
    pub evaluated: usize,
    pub changed: usize,
    pub notified: usize,
    pub failed: usize,
    pub conflicts: usize,
}

impl TriggerSummary {
    fn new(mode: TriggerMode, candidates: usize) -> Self {
        Self {
            mode,
            message: if candidates == 0 { NO_ACTIVE_SUBSCRIPTIONS } else { SUCCESS }.to_string(),
            candidates,
            evaluated: 0,
            changed: 0,
            notified: 0,
            failed: 0,
            conflicts: 0,
        }
    }

    fn record(&mut self, outcome: CandidateOutcome) {
        match outcome {
            CandidateOutcome::Unchanged => self.evaluated += 1,
            CandidateOutcome::Changed { delivered } => {
                self.evaluated += 1;
                self.changed += 1;
                self.notified += delivered;
            }
            CandidateOutcome::Advised { delivered } => {
                self.evaluated += 1;
                self.notified += delivered;
            }
            CandidateOutcome::Conflict => {
                self.evaluated += 1;
                self.conflicts += 1;
            }
            CandidateOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug)]
enum CandidateOutcome {
    Unchanged,
    Changed { delivered: usize },
    Advised { delivered: usize },
    Conflict,
    Failed,
}

/// What a run does once a candidate has been classified.
#[derive(Clone)]
enum Action {
    /// Persist changes through compare-and-set and notify the members.
    Persist,
    /// Report non-fallback advice to the requester only.
    Advise { requester: SubscriberId, fallback: State },
}

/// Runs the fetch, classify, compare, set, notify pipeline over subscriptions.
#[derive(Clone)]
pub struct TriggerController {
    store: Arc<dyn SubscriptionStore>,
    source: Arc<dyn PriceSource>,
    dispatcher: Arc<NotificationDispatcher>,
    engine: IndicatorEngine,
    config: TriggerConfig,
}

impl TriggerController {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        source: Arc<dyn PriceSource>,
        dispatcher: Arc<NotificationDispatcher>,
        engine: IndicatorEngine,
        config: TriggerConfig,
    ) -> Self {
        Self {
            store,
            source,
            dispatcher,
            engine,
            config,
        }
    }

    /// Re-evaluate every subscription that has members and persist state changes.
    pub async fn run_batch(&self) -> Result<TriggerSummary, AdvisoryError> {
        let candidates: Vec<Subscription> = self
            .store
            .list_subscriptions(&SubscriptionFilter::all())
            .await?
            .into_iter()
            .filter(|s| !s.members.is_empty())
            .collect();

        self.run(TriggerMode::Batch, candidates, Action::Persist).await
    }

    /// Evaluate the subscriber's subscriptions and message them directly.
    /// Nothing is persisted and other members are not contacted.
    pub async fn run_for_subscriber(
        &self,
        subscriber_id: &SubscriberId,
    ) -> Result<TriggerSummary, AdvisoryError> {
        let candidates = self
            .store
            .list_subscriptions(&SubscriptionFilter::subscriber(subscriber_id.clone()))
            .await?;
        let fallback = self.store.fallback_state().await?;

        let action = Action::Advise {
            requester: subscriber_id.clone(),
            fallback,
        };
        self.run(TriggerMode::OnDemand, candidates, action).await
    }

    async fn run(
        &self,
        mode: TriggerMode,
        candidates: Vec<Subscription>,
        action: Action,
    ) -> Result<TriggerSummary, AdvisoryError> {
        let mut summary = TriggerSummary::new(mode, candidates.len());
        if candidates.is_empty() {
            tracing::info!("{:?} trigger: no active subscriptions", mode);
            return Ok(summary);
        }

        let rules = Arc::new(self.store.rule_table().await?);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!("{:?} trigger: evaluating {} subscriptions", mode, candidates.len());

        for subscription in candidates {
            let controller = self.clone();
            let rules = Arc::clone(&rules);
            let semaphore = Arc::clone(&semaphore);
            let action = action.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return CandidateOutcome::Failed;
                };
                controller.evaluate(subscription, &rules, &action).await
            });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    tracing::error!("Trigger task error: {}", e);
                    summary.record(CandidateOutcome::Failed);
                }
            }
        }

        tracing::info!(
            "{:?} trigger complete: {}/{} evaluated, {} changed, {} notified, {} failed, {} conflicts",
            mode,
            summary.evaluated,
            summary.candidates,
            summary.changed,
            summary.notified,
            summary.failed,
            summary.conflicts
        );

        Ok(summary)
    }

    async fn evaluate(
        &self,
        subscription: Subscription,
        rules: &RuleTable,
        action: &Action,
    ) -> CandidateOutcome {
        let ticker = subscription.ticker();

        let bars = match self
            .source
            .fetch_history(ticker, &subscription.period, &subscription.interval)
            .await
        {
            Ok(bars) if bars.is_empty() => {
                tracing::warn!("No price history for {}, skipping", ticker);
                return CandidateOutcome::Failed;
            }
            Ok(bars) => bars,
            Err(e) => {
                tracing::warn!("Failed to fetch history for {} from {}: {}", ticker, self.source.name(), e);
                return CandidateOutcome::Failed;
            }
        };

        let series = match self.engine.compute(&bars) {
            Ok(series) => series,
            Err(e) => {
                tracing::warn!("Cannot compute indicators for {}: {}", ticker, e);
                return CandidateOutcome::Failed;
            }
        };

        let new_state = classify(&series.latest().values(), rules).clone();

        match action {
            Action::Persist => {
                if new_state.id == subscription.state.id {
                    tracing::debug!("{} remains {}", ticker, new_state);
                    return CandidateOutcome::Unchanged;
                }

                match self
                    .store
                    .compare_and_set_state(subscription.id, &subscription.state, &new_state)
                    .await
                {
                    Ok(()) => {
                        tracing::info!("{} changed from {} to {}", ticker, subscription.state, new_state);
                        let report = self
                            .dispatcher
                            .dispatch(&subscription, &new_state, &bars, &series, None)
                            .await;
                        CandidateOutcome::Changed {
                            delivered: report.delivered,
                        }
                    }
                    Err(e) if e.is_conflict() => {
                        tracing::info!("Skipping notification for {}: {}", ticker, e);
                        CandidateOutcome::Conflict
                    }
                    Err(e) => {
                        tracing::warn!("Failed to store state for {}: {}", ticker, e);
                        CandidateOutcome::Failed
                    }
                }
            }
            Action::Advise { requester, fallback } => {
                if new_state.id == fallback.id {
                    return CandidateOutcome::Unchanged;
                }

                let recipients = std::slice::from_ref(requester);
                let report = self
                    .dispatcher
                    .dispatch(&subscription, &new_state, &bars, &series, Some(recipients))
                    .await;
                CandidateOutcome::Advised {
                    delivered: report.delivered,
                }
            }
        }
    }
}
