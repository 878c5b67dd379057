use advisory_core::{AdvisoryError, Bar, Interval, Period, PriceSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const BASE_URL: &str = "https://api.polygon.io";
/// Upper bound on followed `next_url` pages for one aggregates request.
const MAX_PAGES: usize = 20;

/// Sliding-window rate limiter: at most `max_requests` per `window` duration.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests: max_requests.max(1),
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            // Remove timestamps outside the window
            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            let oldest = match ts.front() {
                Some(&oldest) if ts.len() >= self.max_requests => oldest,
                _ => {
                    ts.push_back(now);
                    return;
                }
            };

            // Wait until the oldest request falls out of the window
            let sleep_dur = (oldest + self.window).saturating_duration_since(now)
                + Duration::from_millis(50);
            drop(ts);
            tracing::debug!("Rate limiter: waiting {:.1}s for Polygon API slot", sleep_dur.as_secs_f64());
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolygonConfig {
    pub api_key: String,
    /// Requests per minute.
    pub rate_limit: usize,
    pub base_url: String,
}

impl PolygonConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("POLYGON_API_KEY").unwrap_or_default(),
            // Free tier users should set POLYGON_RATE_LIMIT=5
            rate_limit: std::env::var("POLYGON_RATE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            base_url: std::env::var("POLYGON_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| BASE_URL.to_string()),
        }
    }
}

/// Polygon aggregates API as a `PriceSource`.
#[derive(Clone)]
pub struct PolygonClient {
    api_key: String,
    base_url: String,
    client: Client,
    rate_limiter: RateLimiter,
}

impl PolygonClient {
    pub fn new(config: PolygonConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            rate_limiter: RateLimiter::new(config.rate_limit, Duration::from_secs(60)),
        }
    }

    /// Send a request with rate limiting and automatic 429 retry.
    async fn send_request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, AdvisoryError> {
        let request = builder.build().map_err(|e| AdvisoryError::Fetch(e.to_string()))?;

        for attempt in 0..3u32 {
            self.rate_limiter.acquire().await;
            let req_clone = request
                .try_clone()
                .ok_or_else(|| AdvisoryError::Fetch("Cannot clone request".to_string()))?;
            let response = self
                .client
                .execute(req_clone)
                .await
                .map_err(|e| AdvisoryError::Fetch(e.to_string()))?;

            if response.status().as_u16() != 429 {
                return Ok(response);
            }

            let wait_secs = 15u64;
            tracing::warn!("Polygon 429 rate limited, waiting {}s before retry {}/3", wait_secs, attempt + 1);
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
        }

        Err(AdvisoryError::Fetch("Rate limited by Polygon after 3 retries".to_string()))
    }

    fn aggregates_url(
        &self,
        symbol: &str,
        multiplier: u32,
        timespan: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> String {
        format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            symbol,
            multiplier,
            timespan,
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d")
        )
    }

    /// Get aggregates (bars) for a symbol, oldest first.
    /// Follows `next_url` until every page of the range has been read.
    pub async fn get_aggregates(
        &self,
        symbol: &str,
        multiplier: u32,
        timespan: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, AdvisoryError> {
        let url = self.aggregates_url(symbol, multiplier, timespan, from, to);
        let mut builder = self.client.get(&url).query(&[
            ("apiKey", self.api_key.as_str()),
            ("adjusted", "true"),
            ("sort", "asc"),
            ("limit", "50000"),
        ]);
        let mut bars = Vec::new();

        for page in 1..=MAX_PAGES {
            let response = self.send_request(builder).await?;

            if !response.status().is_success() {
                return Err(AdvisoryError::Fetch(format!(
                    "HTTP {}: {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                )));
            }

            let agg_response: AggregateResponse = response
                .json()
                .await
                .map_err(|e| AdvisoryError::Fetch(e.to_string()))?;

            // next_url carries the cursor but not the key
            let next_url = agg_response.next_url.clone();
            bars.extend(agg_response.into_bars());

            match next_url {
                Some(next) if page < MAX_PAGES => {
                    builder = self
                        .client
                        .get(&next)
                        .query(&[("apiKey", self.api_key.as_str())]);
                }
                Some(_) => {
                    tracing::warn!(
                        "Aggregates for {} exceed {} pages, newest bars are missing",
                        symbol,
                        MAX_PAGES
                    );
                    break;
                }
                None => break,
            }
        }

        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        Ok(bars)
    }
}

#[async_trait]
impl PriceSource for PolygonClient {
    async fn fetch_history(
        &self,
        ticker: &str,
        period: &Period,
        interval: &Interval,
    ) -> Result<Vec<Bar>, AdvisoryError> {
        let to = Utc::now();
        let from = period.start(to);
        let bars = self
            .get_aggregates(ticker, interval.multiplier, interval.unit.timespan(), from, to)
            .await?;
        tracing::debug!("Fetched {} {} bars for {} over {}", bars.len(), interval, ticker, period);
        Ok(bars)
    }

    fn name(&self) -> &str {
        "polygon"
    }
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    #[serde(default)]
    results: Vec<AggregateResult>,
    #[serde(default)]
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AggregateResult {
    t: i64, // timestamp
    o: f64, // open
    h: f64, // high
    l: f64, // low
    c: f64, // close
    #[serde(default)]
    v: f64, // volume
}

impl AggregateResponse {
    fn into_bars(self) -> Vec<Bar> {
        let mut bars: Vec<Bar> = self
            .results
            .into_iter()
            .filter_map(|r| {
                Some(Bar {
                    timestamp: DateTime::from_timestamp_millis(r.t)?,
                    open: r.o,
                    high: r.h,
                    low: r.l,
                    close: r.c,
                    volume: r.v,
                })
            })
            .collect();
        bars.sort_by_key(|b| b.timestamp);
        bars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client() -> PolygonClient {
        PolygonClient::new(PolygonConfig {
            api_key: "test".to_string(),
            rate_limit: 5,
            base_url: "http://127.0.0.1:1/".to_string(),
        })
    }

    #[test]
    fn test_aggregates_url() {
        let from = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 7, 2, 0, 0, 0).unwrap();
        let url = client().aggregates_url("AAPL", 1, "day", from, to);
        assert_eq!(url, "http://127.0.0.1:1/v2/aggs/ticker/AAPL/range/1/day/2024-01-02/2024-07-02");
    }

    #[test]
    fn test_parse_aggregates_sorted() {
        let json = r#"{
            "ticker": "AAPL",
            "status": "OK",
            "results": [
                { "t": 1704240000000, "o": 2.0, "h": 3.0, "l": 1.0, "c": 2.5, "v": 100 },
                { "t": 1704153600000, "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5 }
            ]
        }"#;
        let bars = serde_json::from_str::<AggregateResponse>(json).unwrap().into_bars();

        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp < bars[1].timestamp);
        assert_eq!(bars[0].close, 1.5);
        assert_eq!(bars[0].volume, 0.0);
    }

    #[test]
    fn test_parse_empty_results() {
        let bars = serde_json::from_str::<AggregateResponse>(r#"{ "resultsCount": 0 }"#)
            .unwrap()
            .into_bars();
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limiter_admits_up_to_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
                .await
                .unwrap();
        }
        assert!(tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
            .await
            .is_err());
    }

    /// Serves two aggregate pages; the first links to the second via `next_url`.
    async fn spawn_paged_server(requests: Arc<std::sync::atomic::AtomicUsize>) -> String {
        use axum::{extract::State, http::Uri, Json, Router};
        use serde_json::{json, Value};
        use std::sync::atomic::Ordering;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let next_url = format!("{}/v2/aggs/page2?cursor=abc", base);

        let handler = move |State(requests): State<Arc<std::sync::atomic::AtomicUsize>>, uri: Uri| {
            let next_url = next_url.clone();
            async move {
                requests.fetch_add(1, Ordering::SeqCst);
                let query = uri.query().unwrap_or_default();
                assert!(query.contains("apiKey=test"));
                let body: Value = if uri.path().ends_with("page2") {
                    json!({
                        "results": [{ "t": 1704240000000_i64, "o": 999.0, "h": 999.0, "l": 999.0, "c": 999.0 }]
                    })
                } else {
                    json!({
                        "results": [{ "t": 1704153600000_i64, "o": 1.0, "h": 1.0, "l": 1.0, "c": 1.0 }],
                        "next_url": next_url
                    })
                };
                Json(body)
            }
        };

        let app = Router::new().fallback(handler).with_state(requests);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn test_get_aggregates_follows_next_url() {
        let requests = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let base_url = spawn_paged_server(Arc::clone(&requests)).await;
        let client = PolygonClient::new(PolygonConfig {
            api_key: "test".to_string(),
            rate_limit: 100,
            base_url,
        });

        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let bars = client.get_aggregates("AAPL", 1, "minute", from, to).await.unwrap();

        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars.last().unwrap().close, 999.0);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_fetch_error() {
        let err = client()
            .fetch_history("AAPL", &Period::default(), &Interval::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdvisoryError::Fetch(_)));
    }
}
