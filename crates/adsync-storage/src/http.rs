//! HTTP fetch utilities: bearer-authenticated JSON GETs with global and
//! per-account concurrency limits, an optional per-account request rate, and
//! short in-request retries for connection-level failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff, also used by the worker for job-level retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_account_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub account_rate_limit: Option<AccountRateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_account_concurrency: 1,
            backoff: BackoffPolicy::default(),
            account_rate_limit: None,
        }
    }
}

/// Request budget per ad account: up to `burst` calls back to back, then
/// `per_second` sustained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountRateLimit {
    pub per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    tokens: f64,
    refilled_at: Instant,
}

#[derive(Debug)]
pub struct AccountRateLimiter {
    per_second: f64,
    burst: f64,
    budgets: Mutex<HashMap<String, Budget>>,
}

impl AccountRateLimiter {
    /// `None` when the limit does not describe a positive rate.
    pub fn new(limit: AccountRateLimit) -> Option<Self> {
        if !limit.per_second.is_finite() || limit.per_second <= 0.0 {
            return None;
        }
        Some(Self {
            per_second: limit.per_second,
            burst: f64::from(limit.burst.max(1)),
            budgets: Mutex::new(HashMap::new()),
        })
    }

    /// Take one request from `account_id`'s budget, or report how long until
    /// one is available.
    async fn try_take(&self, account_id: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut budgets = self.budgets.lock().await;
        let budget = budgets.entry(account_id.to_string()).or_insert(Budget {
            tokens: self.burst,
            refilled_at: now,
        });
        let earned = now.duration_since(budget.refilled_at).as_secs_f64() * self.per_second;
        budget.tokens = (budget.tokens + earned).min(self.burst);
        budget.refilled_at = now;
        if budget.tokens >= 1.0 {
            budget.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - budget.tokens) / self.per_second))
        }
    }

    pub async fn acquire(&self, account_id: &str) {
        while let Some(wait) = self.try_take(account_id).await {
            debug!(account_id, ?wait, "account request budget spent; waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Closed => RetryDisposition::Retryable,
        }
    }
}

/// Parse a delta-seconds `Retry-After` header.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_account_limit: usize,
    per_account: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiter: Option<AccountRateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let rate_limiter = config.account_rate_limit.and_then(AccountRateLimiter::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_account_limit: config.per_account_concurrency.max(1),
            per_account: Mutex::new(HashMap::new()),
            rate_limiter,
            backoff: config.backoff,
        })
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limiter.is_some()
    }

    async fn per_account_semaphore(&self, account_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_account.lock().await;
        map.entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_account_limit)))
            .clone()
    }

    /// GET `url` with `query` and a bearer token.
    ///
    /// Transport errors and 5xx are retried in-request per the backoff
    /// policy; 429 and other statuses come back immediately so the caller
    /// can reschedule the whole job.
    pub async fn get_json(
        &self,
        account_id: &str,
        url: &str,
        query: &[(String, String)],
        bearer_token: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_account = self.per_account_semaphore(account_id).await;
        let _account = per_account.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire(account_id).await;
        }

        let span = info_span!("http_fetch", account_id, url);
        self.get_with_retries(url, query, bearer_token)
            .instrument(span)
            .await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: &[(String, String)],
        bearer_token: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let resp_result = self
                .client
                .get(url)
                .query(query)
                .bearer_auth(bearer_token)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let retry_after = retry_after_from_headers(resp.headers());
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying upstream server error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        retry_after,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_separates_rate_limits() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_from_headers(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
        assert_eq!(
            retry_after_from_headers(&headers),
            Some(Duration::from_secs(42))
        );
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after_from_headers(&headers), None);
    }

    #[tokio::test(start_paused = true)]
    async fn account_budget_is_spent_per_account() {
        let limiter = AccountRateLimiter::new(AccountRateLimit {
            per_second: 2.0,
            burst: 2,
        })
        .unwrap();
        let start = Instant::now();
        limiter.acquire("act_1").await;
        limiter.acquire("act_1").await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire("act_2").await;
        assert_eq!(start.elapsed(), Duration::ZERO, "other accounts keep their own budget");

        limiter.acquire("act_1").await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[test]
    fn non_positive_rates_disable_the_limiter() {
        let off = |per_second| AccountRateLimiter::new(AccountRateLimit { per_second, burst: 5 });
        assert!(off(0.0).is_none());
        assert!(off(-1.0).is_none());
        assert!(off(f64::NAN).is_none());
        assert!(off(0.5).is_some());
    }
}
