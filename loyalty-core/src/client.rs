//! Accrual Client
//!
//! Polls the external accrual service for one order until it reports a
//! terminal result or the backoff budget runs out. The transport sits behind
//! [`AccrualSource`] so tests can script upstream behaviour; response
//! classification ([`classify`]) and the delay schedule
//! ([`BackoffPolicy`]) are pure.

use crate::backoff::BackoffPolicy;
use crate::metrics::Metrics;
use crate::types::{OrderNumber, Points, TerminalResult};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Raw upstream reply, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualResponse {
    pub status: u16,
    /// `Retry-After` header, in seconds
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

impl AccrualResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// Failure of a single attempt. Never escapes [`AccrualClient::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Try again later, no sooner than `retry_after` if given
    Retryable {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// The request itself is wrong; retrying cannot help
    Fatal(String),
}

impl QueryError {
    fn retryable(reason: impl Into<String>) -> Self {
        QueryError::Retryable {
            reason: reason.into(),
            retry_after: None,
        }
    }
}

/// Transport to the accrual service: one request per call
#[async_trait]
pub trait AccrualSource: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &Url,
        order: &OrderNumber,
    ) -> std::result::Result<AccrualResponse, QueryError>;
}

/// `reqwest`-backed [`AccrualSource`]
#[derive(Debug, Clone)]
pub struct HttpAccrualSource {
    client: Client,
}

impl HttpAccrualSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccrualSource for HttpAccrualSource {
    async fn fetch(
        &self,
        endpoint: &Url,
        order: &OrderNumber,
    ) -> std::result::Result<AccrualResponse, QueryError> {
        let url = order_url(endpoint, order);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_builder() {
                QueryError::Fatal(format!("cannot build request for {}: {}", url, e))
            } else {
                QueryError::retryable(format!("transport error: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);

        let body = response
            .bytes()
            .await
            .map_err(|e| QueryError::retryable(format!("failed to read body: {}", e)))?;

        Ok(AccrualResponse {
            status,
            retry_after,
            body: body.to_vec(),
        })
    }
}

/// `{endpoint}/api/orders/{order}`
pub fn order_url(endpoint: &Url, order: &OrderNumber) -> String {
    format!(
        "{}/api/orders/{}",
        endpoint.as_str().trim_end_matches('/'),
        order
    )
}

/// Delay-seconds form only; HTTP dates are ignored
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Endpoint must be an absolute http(s) URL
pub fn parse_endpoint(endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint.trim()).map_err(|e| {
        Error::FatalConfiguration(format!("invalid accrual endpoint '{}': {}", endpoint, e))
    })?;

    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        _ => Err(Error::FatalConfiguration(format!(
            "accrual endpoint '{}' is not an http(s) URL",
            endpoint
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct AccrualReply {
    order: String,
    status: String,
    #[serde(default)]
    accrual: Option<Decimal>,
}

/// Map one upstream reply to a terminal result or an attempt failure
pub fn classify(
    order: &OrderNumber,
    response: &AccrualResponse,
) -> std::result::Result<TerminalResult, QueryError> {
    match response.status {
        200 => classify_body(order, &response.body),
        204 | 404 => Err(QueryError::retryable(format!(
            "order not yet known upstream ({})",
            response.status
        ))),
        429 => Err(QueryError::Retryable {
            reason: "rate limited (429)".to_string(),
            retry_after: response.retry_after,
        }),
        500..=599 => Err(QueryError::Retryable {
            reason: format!("upstream error ({})", response.status),
            retry_after: response.retry_after,
        }),
        400..=499 => Err(QueryError::Fatal(format!(
            "request rejected with {}",
            response.status
        ))),
        other => Err(QueryError::retryable(format!(
            "unexpected status {}",
            other
        ))),
    }
}

fn classify_body(
    order: &OrderNumber,
    body: &[u8],
) -> std::result::Result<TerminalResult, QueryError> {
    let malformed = |reason: String| {
        warn!(order = %order, reason = %reason, "Malformed accrual response");
        QueryError::retryable(format!("malformed response: {}", reason))
    };

    let reply: AccrualReply =
        serde_json::from_slice(body).map_err(|e| malformed(e.to_string()))?;

    if reply.order.trim() != order.as_str() {
        return Err(malformed(format!(
            "reply is for order '{}'",
            reply.order
        )));
    }

    match reply.status.as_str() {
        "PROCESSED" => {
            let accrual = match reply.accrual {
                Some(amount) => Points::from_decimal(amount).map_err(|e| malformed(e.to_string()))?,
                None => Points::ZERO,
            };
            Ok(TerminalResult::Processed { accrual })
        }
        "INVALID" => Ok(TerminalResult::Invalid),
        "REGISTERED" | "PROCESSING" => Err(QueryError::retryable(format!(
            "upstream status {}",
            reply.status
        ))),
        other => Err(malformed(format!("unknown status '{}'", other))),
    }
}

/// Budget-bounded polling around an [`AccrualSource`]
#[derive(Clone)]
pub struct AccrualClient {
    source: Arc<dyn AccrualSource>,
    policy: BackoffPolicy,
    request_timeout: Duration,
    metrics: Metrics,
}

impl AccrualClient {
    pub fn new(
        source: Arc<dyn AccrualSource>,
        policy: BackoffPolicy,
        request_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            source,
            policy,
            request_timeout,
            metrics,
        }
    }

    /// Poll until terminal, `RetryBudgetExhausted` or `FatalConfiguration`.
    ///
    /// Each attempt's timeout is clamped to what is left of the budget, so
    /// the whole call never outlives `max_elapsed`.
    pub async fn query(&self, order: &OrderNumber, endpoint: &str) -> Result<TerminalResult> {
        let url = parse_endpoint(endpoint)?;
        let budget = self.policy.max_elapsed();
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            let per_attempt = match budget {
                Some(budget) => self
                    .request_timeout
                    .min(budget.saturating_sub(started.elapsed())),
                None => self.request_timeout,
            };

            self.metrics.accrual_attempts.inc();
            attempts += 1;

            let outcome = match tokio::time::timeout(per_attempt, self.source.fetch(&url, order)).await {
                Ok(Ok(response)) => classify(order, &response),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(QueryError::retryable(format!(
                    "attempt timed out after {}ms",
                    per_attempt.as_millis()
                ))),
            };

            let (reason, retry_after) = match outcome {
                Ok(result) => {
                    debug!(order = %order, attempts, status = %result.status(), "Accrual resolved");
                    return Ok(result);
                }
                Err(QueryError::Fatal(reason)) => {
                    return Err(Error::FatalConfiguration(format!(
                        "order {}: {}",
                        order, reason
                    )));
                }
                Err(QueryError::Retryable {
                    reason,
                    retry_after,
                }) => (reason, retry_after),
            };

            match self.policy.next_delay(
                attempts - 1,
                started.elapsed(),
                retry_after,
                rand::random::<f64>(),
            ) {
                Some(delay) => {
                    debug!(
                        order = %order,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Accrual not ready, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    self.metrics.retry_budget_exhausted.inc();
                    return Err(Error::RetryBudgetExhausted {
                        order: order.clone(),
                        attempts,
                        last_error: reason,
                        retry_after,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ORDER: &str = "79927398713";

    fn order() -> OrderNumber {
        OrderNumber::parse(ORDER).unwrap()
    }

    fn processed(accrual: &str) -> AccrualResponse {
        AccrualResponse::new(
            200,
            format!(
                r#"{{"order":"{}","status":"PROCESSED","accrual":{}}}"#,
                ORDER, accrual
            ),
        )
    }

    /// Replays scripted replies, then repeats `fallback` forever
    struct ScriptedSource {
        script: Mutex<VecDeque<std::result::Result<AccrualResponse, QueryError>>>,
        fallback: std::result::Result<AccrualResponse, QueryError>,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(
            script: Vec<std::result::Result<AccrualResponse, QueryError>>,
            fallback: std::result::Result<AccrualResponse, QueryError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AccrualSource for ScriptedSource {
        async fn fetch(
            &self,
            _endpoint: &Url,
            _order: &OrderNumber,
        ) -> std::result::Result<AccrualResponse, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    /// Never answers
    struct HangingSource;

    #[async_trait]
    impl AccrualSource for HangingSource {
        async fn fetch(
            &self,
            _endpoint: &Url,
            _order: &OrderNumber,
        ) -> std::result::Result<AccrualResponse, QueryError> {
            std::future::pending().await
        }
    }

    fn client(source: Arc<dyn AccrualSource>) -> AccrualClient {
        AccrualClient::new(
            source,
            BackoffPolicy::default(),
            Duration::from_secs(3),
            Metrics::new().unwrap(),
        )
    }

    #[test]
    fn test_classify_terminal_bodies() {
        assert_eq!(
            classify(&order(), &processed("500")),
            Ok(TerminalResult::Processed {
                accrual: Points::from_whole(500)
            })
        );
        assert_eq!(
            classify(&order(), &processed("729.98")),
            Ok(TerminalResult::Processed {
                accrual: Points::from_minor(72998)
            })
        );

        let invalid = AccrualResponse::new(200, format!(r#"{{"order":"{}","status":"INVALID"}}"#, ORDER));
        assert_eq!(classify(&order(), &invalid), Ok(TerminalResult::Invalid));

        let no_accrual =
            AccrualResponse::new(200, format!(r#"{{"order":"{}","status":"PROCESSED"}}"#, ORDER));
        assert_eq!(
            classify(&order(), &no_accrual),
            Ok(TerminalResult::Processed {
                accrual: Points::ZERO
            })
        );
    }

    #[test]
    fn test_classify_retryable() {
        let pending = AccrualResponse::new(
            200,
            format!(r#"{{"order":"{}","status":"REGISTERED"}}"#, ORDER),
        );
        let malformed = AccrualResponse::new(200, "not json");
        let mismatch = AccrualResponse::new(
            200,
            r#"{"order":"12345678903","status":"PROCESSED","accrual":5}"#,
        );
        let unknown = AccrualResponse::new(
            200,
            format!(r#"{{"order":"{}","status":"DONE"}}"#, ORDER),
        );

        for response in [
            pending,
            malformed,
            mismatch,
            unknown,
            processed("-5"),
            AccrualResponse::new(204, ""),
            AccrualResponse::new(404, ""),
            AccrualResponse::new(500, ""),
            AccrualResponse::new(503, ""),
        ] {
            assert!(
                matches!(classify(&order(), &response), Err(QueryError::Retryable { .. })),
                "status {} should be retryable",
                response.status
            );
        }
    }

    #[test]
    fn test_classify_rate_limit_carries_hint() {
        let response = AccrualResponse {
            status: 429,
            retry_after: Some(Duration::from_secs(60)),
            body: Vec::new(),
        };

        assert_eq!(
            classify(&order(), &response),
            Err(QueryError::Retryable {
                reason: "rate limited (429)".to_string(),
                retry_after: Some(Duration::from_secs(60)),
            })
        );
    }

    #[test]
    fn test_classify_other_client_errors_fatal() {
        for status in [400, 401, 403, 405] {
            assert!(matches!(
                classify(&order(), &AccrualResponse::new(status, "")),
                Err(QueryError::Fatal(_))
            ));
        }
    }

    #[test]
    fn test_endpoint_parsing() {
        let url = parse_endpoint("http://localhost:8080/").unwrap();
        assert_eq!(order_url(&url, &order()), "http://localhost:8080/api/orders/79927398713");

        assert!(matches!(parse_endpoint(""), Err(Error::FatalConfiguration(_))));
        assert!(matches!(parse_endpoint("localhost:8080"), Err(Error::FatalConfiguration(_))));
        assert!(matches!(parse_endpoint("ftp://host"), Err(Error::FatalConfiguration(_))));
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(parse_retry_after(" 60 "), Some(Duration::from_secs(60)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_retries_until_terminal() {
        let source = ScriptedSource::new(
            vec![
                Ok(AccrualResponse::new(204, "")),
                Ok(AccrualResponse::new(500, "")),
                Err(QueryError::retryable("connection refused")),
            ],
            Ok(processed("500")),
        );

        let result = client(source.clone())
            .query(&order(), "http://accrual")
            .await
            .unwrap();

        assert_eq!(
            result,
            TerminalResult::Processed {
                accrual: Points::from_whole(500)
            }
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_budget_bounds_total_time() {
        let source = ScriptedSource::new(Vec::new(), Ok(AccrualResponse::new(204, "")));
        let started = Instant::now();

        let result = client(source.clone()).query(&order(), "http://accrual").await;

        assert!(started.elapsed() <= Duration::from_secs(10));
        match result {
            Err(Error::RetryBudgetExhausted { attempts, .. }) => {
                assert_eq!(attempts, source.calls.load(Ordering::SeqCst));
                assert!(attempts > 1);
            }
            other => panic!("expected budget exhaustion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_hanging_upstream_respects_budget() {
        let started = Instant::now();

        let result = client(Arc::new(HangingSource))
            .query(&order(), "http://accrual")
            .await;

        assert!(started.elapsed() <= Duration::from_secs(10));
        assert!(matches!(result, Err(Error::RetryBudgetExhausted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_long_retry_after_exhausts_budget() {
        let source = ScriptedSource::new(
            Vec::new(),
            Ok(AccrualResponse {
                status: 429,
                retry_after: Some(Duration::from_secs(60)),
                body: Vec::new(),
            }),
        );
        let started = Instant::now();

        let result = client(source.clone()).query(&order(), "http://accrual").await;

        match result {
            Err(Error::RetryBudgetExhausted {
                attempts,
                retry_after,
                ..
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(retry_after, Some(Duration::from_secs(60)));
            }
            other => panic!("expected budget exhaustion, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_fatal_is_distinct() {
        let source = ScriptedSource::new(Vec::new(), Ok(AccrualResponse::new(401, "")));
        let result = client(source.clone()).query(&order(), "http://accrual").await;
        assert!(matches!(result, Err(Error::FatalConfiguration(_))));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let source = ScriptedSource::new(Vec::new(), Ok(processed("1")));
        let result = client(source.clone()).query(&order(), "not a url").await;
        assert!(matches!(result, Err(Error::FatalConfiguration(_))));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
