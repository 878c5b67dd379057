use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use advisory_core::{
    AdvisoryError, Instrument, Member, State, StateId, SubscriberId, Subscription,
    SubscriptionId,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use state_classifier::{RuleSetDefinition, RuleTable, ThresholdRule};
use tokio::sync::OnceCell;

use crate::store::normalize_ticker;
use crate::{StoreConfig, SubscribeRequest, SubscriptionError, SubscriptionFilter, SubscriptionStore};

const SUBSCRIPTION_COLUMNS: &str = r#"
    SELECT s.id, s.instrument_id, i.ticker, i.name AS instrument_name,
           s.period, s.bar_interval, s.state_id,
           st.name AS state_name, st.description AS state_description, st.priority AS state_priority
    FROM subscriptions s
    JOIN instruments i ON i.id = s.instrument_id
    JOIN states st ON st.id = s.state_id
"#;

fn storage(e: sqlx::Error) -> AdvisoryError {
    AdvisoryError::Storage(e.to_string())
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    instrument_id: i64,
    ticker: String,
    instrument_name: String,
    period: String,
    bar_interval: String,
    state_id: i64,
    state_name: String,
    state_description: String,
    state_priority: i32,
}

#[derive(sqlx::FromRow)]
struct MemberRow {
    subscription_id: i64,
    subscriber_id: String,
    notifications_active: bool,
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: i64,
    name: String,
    description: String,
    priority: i32,
    is_fallback: bool,
}

impl StateRow {
    fn into_state(self) -> State {
        State::new(self.id, self.name, self.description, self.priority)
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    state_id: i64,
    indicator: String,
    lower_bound: f64,
    upper_bound: f64,
}

enum Scope<'a> {
    All,
    Subscriber(&'a SubscriberId),
    Id(SubscriptionId),
}

/// SQLite-backed store. State changes go through a conditional `UPDATE`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    subscriptions_limit: usize,
    fallback: std::sync::Arc<OnceCell<State>>,
}

impl SqliteStore {
    /// Open (or create) the database, apply the schema and seed rules when empty.
    pub async fn connect(
        config: &StoreConfig,
        rules: &RuleSetDefinition,
    ) -> Result<Self, AdvisoryError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(storage)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // Every connection to an in-memory database is a separate database
        let in_memory = config.database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await.map_err(storage)?;

        let store = Self {
            pool,
            subscriptions_limit: config.subscriptions_limit,
            fallback: Default::default(),
        };
        store.init_schema().await?;
        store.seed_rules(rules).await?;

        let table = store.rule_table().await?;
        tracing::info!(
            "Subscription store ready: {} states, {} rules, fallback '{}'",
            table.states().len(),
            table.rules().len(),
            table.fallback()
        );

        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), AdvisoryError> {
        let schema = include_str!("../schema.sql");

        for statement in schema.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&self.pool).await.map_err(storage)?;
            }
        }

        Ok(())
    }

    /// Write the rule definition into empty rule tables. Existing rules win.
    async fn seed_rules(&self, definition: &RuleSetDefinition) -> Result<(), AdvisoryError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM states")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        if count > 0 {
            return Ok(());
        }

        let table = RuleTable::from_definition(definition)?;
        let fallback_id = table.fallback().id;
        let mut tx = self.pool.begin().await.map_err(storage)?;

        for state in table.states() {
            sqlx::query(
                "INSERT INTO states (id, name, description, priority, is_fallback) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(state.id)
            .bind(&state.name)
            .bind(&state.description)
            .bind(state.priority)
            .bind(state.id == fallback_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        for rule in table.rules() {
            sqlx::query("INSERT OR IGNORE INTO indicators (name) VALUES (?)")
                .bind(&rule.indicator)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;

            sqlx::query(
                r#"
                INSERT INTO state_indicators (state_id, indicator_id, lower_bound, upper_bound)
                SELECT ?, id, ?, ? FROM indicators WHERE name = ?
                "#,
            )
            .bind(rule.state_id)
            .bind(rule.lower)
            .bind(rule.upper)
            .bind(&rule.indicator)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        tracing::info!("Seeded {} advisory states", table.states().len());
        Ok(())
    }

    async fn is_registered(&self, subscriber_id: &SubscriberId) -> Result<bool, AdvisoryError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM subscribers WHERE id = ?")
            .bind(subscriber_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.is_some())
    }

    async fn ensure_registered(&self, subscriber_id: &SubscriberId) -> Result<(), SubscriptionError> {
        if self.is_registered(subscriber_id).await? {
            Ok(())
        } else {
            Err(SubscriptionError::NotRegistered(subscriber_id.clone()))
        }
    }

    async fn fetch_subscriptions(&self, scope: Scope<'_>) -> Result<Vec<Subscription>, AdvisoryError> {
        let (rows, members) = match scope {
            Scope::All => {
                let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
                    "{} ORDER BY s.id",
                    SUBSCRIPTION_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
                let members = sqlx::query_as::<_, MemberRow>(
                    r#"
                    SELECT subscription_id, subscriber_id, notifications_active
                    FROM subscription_members
                    ORDER BY subscription_id, id
                    "#,
                )
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
                (rows, members)
            }
            Scope::Subscriber(subscriber_id) => {
                let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
                    "{} WHERE s.id IN (SELECT subscription_id FROM subscription_members WHERE subscriber_id = ?) ORDER BY s.id",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(subscriber_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
                let members = sqlx::query_as::<_, MemberRow>(
                    r#"
                    SELECT subscription_id, subscriber_id, notifications_active
                    FROM subscription_members
                    WHERE subscription_id IN (
                        SELECT subscription_id FROM subscription_members WHERE subscriber_id = ?
                    )
                    ORDER BY subscription_id, id
                    "#,
                )
                .bind(subscriber_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
                (rows, members)
            }
            Scope::Id(id) => {
                let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
                    "{} WHERE s.id = ?",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
                let members = sqlx::query_as::<_, MemberRow>(
                    r#"
                    SELECT subscription_id, subscriber_id, notifications_active
                    FROM subscription_members
                    WHERE subscription_id = ?
                    ORDER BY id
                    "#,
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
                (rows, members)
            }
        };

        let mut grouped: BTreeMap<SubscriptionId, Vec<Member>> = BTreeMap::new();
        for member in members {
            grouped.entry(member.subscription_id).or_default().push(Member {
                subscriber_id: member.subscriber_id.into(),
                notifications_active: member.notifications_active,
            });
        }

        rows.into_iter()
            .map(|row| -> Result<Subscription, AdvisoryError> {
                Ok(Subscription {
                    id: row.id,
                    instrument: Instrument {
                        id: row.instrument_id,
                        ticker: row.ticker,
                        name: row.instrument_name,
                    },
                    period: row.period.parse()?,
                    interval: row.bar_interval.parse()?,
                    state: State::new(
                        row.state_id,
                        row.state_name,
                        row.state_description,
                        row.state_priority,
                    ),
                    members: grouped.remove(&row.id).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn load_subscription(&self, id: SubscriptionId) -> Result<Subscription, AdvisoryError> {
        self.fetch_subscriptions(Scope::Id(id))
            .await?
            .pop()
            .ok_or_else(|| AdvisoryError::NotFound(format!("subscription {}", id)))
    }

    /// Body of `subscribe`, run inside an immediate transaction on `conn`.
    async fn subscribe_locked(
        &self,
        conn: &mut SqliteConnection,
        request: &SubscribeRequest,
        ticker: &str,
        fallback: &State,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let ticker = ticker.to_string();
        let subscriber_id = &request.subscriber_id;
        let period = request.period.to_string();
        let interval = request.interval.to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let (memberships,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM subscription_members WHERE subscriber_id = ?")
                .bind(subscriber_id.as_str())
                .fetch_one(&mut *conn)
                .await
                .map_err(storage)?;
        let limit_reached = memberships as usize >= self.subscriptions_limit;

        let instrument: Option<(i64,)> = sqlx::query_as("SELECT id FROM instruments WHERE ticker = ?")
            .bind(&ticker)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage)?;

        let existing: Option<(i64,)> = match instrument {
            Some((instrument_id,)) => sqlx::query_as(
                "SELECT id FROM subscriptions WHERE instrument_id = ? AND period = ? AND bar_interval = ?",
            )
            .bind(instrument_id)
            .bind(&period)
            .bind(&interval)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage)?,
            None => None,
        };

        let subscription_id = if let Some((id,)) = existing {
            let member: Option<(bool,)> = sqlx::query_as(
                "SELECT notifications_active FROM subscription_members WHERE subscription_id = ? AND subscriber_id = ?",
            )
            .bind(id)
            .bind(subscriber_id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage)?;

            match member {
                Some((true,)) => {
                    return Err(SubscriptionError::AlreadySubscribed {
                        subscriber_id: subscriber_id.clone(),
                        ticker,
                    });
                }
                Some((false,)) => {
                    sqlx::query(
                        "UPDATE subscription_members SET notifications_active = 1 WHERE subscription_id = ? AND subscriber_id = ?",
                    )
                    .bind(id)
                    .bind(subscriber_id.as_str())
                    .execute(&mut *conn)
                    .await
                    .map_err(storage)?;
                    return Ok(id);
                }
                None => {}
            }
            id
        } else {
            if limit_reached {
                return Err(SubscriptionError::SubscriptionLimit {
                    subscriber_id: subscriber_id.clone(),
                    limit: self.subscriptions_limit,
                });
            }

            let instrument_id = match instrument {
                Some((id,)) => id,
                None => {
                    let name = if request.name.trim().is_empty() {
                        ticker.as_str()
                    } else {
                        request.name.trim()
                    };
                    let (id,): (i64,) = sqlx::query_as(
                        "INSERT INTO instruments (ticker, name) VALUES (?, ?) RETURNING id",
                    )
                    .bind(&ticker)
                    .bind(name)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(storage)?;
                    tracing::info!("Tracking new instrument {}", ticker);
                    id
                }
            };

            let (id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO subscriptions (instrument_id, period, bar_interval, state_id, created_at)
                VALUES (?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(instrument_id)
            .bind(&period)
            .bind(&interval)
            .bind(fallback.id)
            .bind(&now)
            .fetch_one(&mut *conn)
            .await
            .map_err(storage)?;
            tracing::info!("Created subscription {} for {} ({} / {})", id, ticker, period, interval);
            id
        };

        if limit_reached {
            return Err(SubscriptionError::SubscriptionLimit {
                subscriber_id: subscriber_id.clone(),
                limit: self.subscriptions_limit,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO subscription_members (subscription_id, subscriber_id, notifications_active, created_at)
            VALUES (?, ?, 1, ?)
            "#,
        )
        .bind(subscription_id)
        .bind(subscriber_id.as_str())
        .bind(&now)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;

        Ok(subscription_id)
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, AdvisoryError> {
        match &filter.subscriber_id {
            Some(subscriber_id) => self.fetch_subscriptions(Scope::Subscriber(subscriber_id)).await,
            None => self.fetch_subscriptions(Scope::All).await,
        }
    }

    async fn compare_and_set_state(
        &self,
        subscription_id: SubscriptionId,
        expected: &State,
        new_state: &State,
    ) -> Result<(), AdvisoryError> {
        let known: Option<(StateId,)> = sqlx::query_as("SELECT id FROM states WHERE id = ?")
            .bind(new_state.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        if known.is_none() {
            return Err(AdvisoryError::NotFound(format!("state {}", new_state.id)));
        }

        let result = sqlx::query("UPDATE subscriptions SET state_id = ? WHERE id = ? AND state_id = ?")
            .bind(new_state.id)
            .bind(subscription_id)
            .bind(expected.id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT st.name FROM subscriptions s JOIN states st ON st.id = s.state_id WHERE s.id = ?",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match current {
            Some((actual,)) => Err(AdvisoryError::Conflict {
                subscription_id,
                expected: expected.name.clone(),
                actual,
            }),
            None => Err(AdvisoryError::NotFound(format!("subscription {}", subscription_id))),
        }
    }

    async fn fallback_state(&self) -> Result<State, AdvisoryError> {
        self.fallback
            .get_or_try_init(|| async {
                sqlx::query_as::<_, StateRow>(
                    "SELECT id, name, description, priority, is_fallback FROM states WHERE is_fallback = 1",
                )
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?
                .map(StateRow::into_state)
                .ok_or_else(|| AdvisoryError::NotFound("fallback state".to_string()))
            })
            .await
            .cloned()
    }

    async fn rule_table(&self) -> Result<RuleTable, AdvisoryError> {
        let rows = sqlx::query_as::<_, StateRow>(
            "SELECT id, name, description, priority, is_fallback FROM states ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let fallback_id = rows
            .iter()
            .find(|s| s.is_fallback)
            .map(|s| s.id)
            .ok_or_else(|| AdvisoryError::InvalidRules("no fallback state configured".to_string()))?;
        let states = rows.into_iter().map(StateRow::into_state).collect();

        let rules = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT si.state_id, ind.name AS indicator, si.lower_bound, si.upper_bound
            FROM state_indicators si
            JOIN indicators ind ON ind.id = si.indicator_id
            ORDER BY si.state_id, si.rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?
        .into_iter()
        .map(|r| ThresholdRule {
            state_id: r.state_id,
            indicator: r.indicator,
            lower: r.lower_bound,
            upper: r.upper_bound,
        })
        .collect();

        RuleTable::new(states, fallback_id, rules)
    }

    async fn register_subscriber(&self, subscriber_id: &SubscriberId) -> Result<(), AdvisoryError> {
        sqlx::query("INSERT OR IGNORE INTO subscribers (id, created_at) VALUES (?, ?)")
            .bind(subscriber_id.as_str())
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription, SubscriptionError> {
        let ticker = normalize_ticker(&request.ticker)?;
        self.ensure_registered(&request.subscriber_id).await?;

        // Read before acquiring: the in-memory pool has one connection
        let fallback = self.fallback_state().await?;

        let mut conn = self.pool.acquire().await.map_err(storage)?;
        // Take the write lock up front so concurrent subscribes wait on the busy timeout
        // instead of failing a shared-to-write lock upgrade.
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(storage)?;

        let outcome = self.subscribe_locked(&mut conn, request, &ticker, &fallback).await;

        let end = if outcome.is_ok() { "COMMIT" } else { "ROLLBACK" };
        let finished = sqlx::query(end).execute(&mut *conn).await;
        if let Err(e) = finished {
            // Never hand a connection with an open transaction back to the pool
            drop(conn.detach());
            if outcome.is_ok() {
                return Err(storage(e).into());
            }
            tracing::warn!("Failed to roll back subscribe for {}: {}", ticker, e);
        } else {
            drop(conn);
        }

        let subscription_id = outcome?;
        Ok(self.load_subscription(subscription_id).await?)
    }

    async fn unsubscribe(
        &self,
        subscriber_id: &SubscriberId,
        ticker: &str,
    ) -> Result<(), SubscriptionError> {
        let ticker = normalize_ticker(ticker)?;
        self.ensure_registered(subscriber_id).await?;

        let instrument: Option<(i64,)> = sqlx::query_as("SELECT id FROM instruments WHERE ticker = ?")
            .bind(&ticker)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        let (instrument_id,) = instrument.ok_or_else(|| SubscriptionError::UnknownInstrument(ticker.clone()))?;

        let result = sqlx::query(
            r#"
            DELETE FROM subscription_members
            WHERE subscriber_id = ?
              AND subscription_id IN (SELECT id FROM subscriptions WHERE instrument_id = ?)
            "#,
        )
        .bind(subscriber_id.as_str())
        .bind(instrument_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
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
        self.ensure_registered(subscriber_id).await?;

        let result = sqlx::query(
            "UPDATE subscription_members SET notifications_active = ? WHERE subscription_id = ? AND subscriber_id = ?",
        )
        .bind(active)
        .bind(subscription_id)
        .bind(subscriber_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(SubscriptionError::NotSubscribed {
                subscriber_id: subscriber_id.clone(),
                target: format!("subscription {}", subscription_id),
            });
        }
        Ok(())
    }
}
