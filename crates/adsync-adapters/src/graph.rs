use std::sync::Arc;
use std::time::Duration;

use adsync_core::SyncError;
use adsync_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use tracing::debug;

use crate::{parse_insights_body, AdsApi, ApiErrorBody, InsightsPage, InsightsRequest};

/// Error codes the upstream uses for throttling, regardless of HTTP status.
const RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613];
const BUSINESS_THROTTLE_FLOOR: i64 = 80_000;
const INVALID_TOKEN_CODE: i64 = 190;

#[derive(Debug, Clone)]
pub struct GraphApiConfig {
    pub base_url: String,
    pub api_version: String,
    pub page_size: u32,
}

impl Default for GraphApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v19.0".to_string(),
            page_size: 500,
        }
    }
}

pub struct GraphInsightsApi {
    fetcher: Arc<HttpFetcher>,
    config: GraphApiConfig,
}

impl GraphInsightsApi {
    pub fn new(fetcher: Arc<HttpFetcher>, config: GraphApiConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn insights_url(&self, account_id: &str) -> String {
        let account = account_id.trim_start_matches("act_");
        format!(
            "{}/{}/act_{}/insights",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version,
            account
        )
    }
}

#[async_trait]
impl AdsApi for GraphInsightsApi {
    async fn fetch_insights(
        &self,
        request: &InsightsRequest,
        cursor: Option<&str>,
    ) -> Result<InsightsPage, SyncError> {
        let url = self.insights_url(&request.account_id);
        let query = request.query(self.config.page_size, cursor);
        let response = self
            .fetcher
            .get_json(&request.account_id, &url, &query, &request.access_token)
            .await
            .map_err(map_fetch_error)?;
        let page = parse_insights_body(&response.body)?;
        debug!(
            account_id = %request.account_id,
            rows = page.rows.len(),
            has_next = page.next_cursor.is_some(),
            "fetched insights page"
        );
        Ok(page)
    }
}

/// Map an error envelope (and the HTTP status, when there was one) onto the
/// job-level taxonomy.
pub(crate) fn classify_api_error(
    status: Option<u16>,
    error: &ApiErrorBody,
    retry_after: Option<Duration>,
) -> SyncError {
    let message = if error.message.is_empty() {
        format!("upstream error {:?}", error.code)
    } else {
        error.message.clone()
    };
    match error.code {
        Some(code) if RATE_LIMIT_CODES.contains(&code) || code >= BUSINESS_THROTTLE_FLOOR => {
            return SyncError::RateLimited {
                retry_after,
                message,
            }
        }
        Some(INVALID_TOKEN_CODE) => return SyncError::Auth(message),
        _ => {}
    }
    match status {
        Some(429) => SyncError::RateLimited {
            retry_after,
            message,
        },
        Some(401 | 403) => SyncError::Auth(message),
        Some(s) if s >= 500 => SyncError::TransientNetwork(message),
        _ => SyncError::PermanentFailure(message),
    }
}

pub fn map_fetch_error(err: FetchError) -> SyncError {
    match err {
        FetchError::Request(e) if e.is_timeout() => SyncError::Timeout(e.to_string()),
        FetchError::Request(e) => SyncError::TransientNetwork(e.to_string()),
        FetchError::Closed => SyncError::TransientNetwork("http fetcher closed".to_string()),
        FetchError::HttpStatus {
            status,
            url,
            retry_after,
            body,
        } => {
            let envelope = ApiErrorBody::from_body(&body).unwrap_or(ApiErrorBody {
                message: format!("http {status} from {url}"),
                code: None,
                error_subcode: None,
            });
            classify_api_error(Some(status), &envelope, retry_after)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16, body: &str, retry_after: Option<Duration>) -> FetchError {
        FetchError::HttpStatus {
            status,
            url: "https://graph.test/v19.0/act_1/insights".into(),
            retry_after,
            body: body.into(),
        }
    }

    #[test]
    fn throttle_codes_map_to_rate_limit_even_on_400() {
        for code in [4, 17, 32, 613, 80_004] {
            let body = format!(r#"{{"error": {{"message": "slow down", "code": {code}}}}}"#);
            let err = map_fetch_error(status_error(400, &body, None));
            assert!(matches!(err, SyncError::RateLimited { .. }), "code {code}");
        }
    }

    #[test]
    fn retry_after_header_is_kept() {
        let err = map_fetch_error(status_error(429, "", Some(Duration::from_secs(30))));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn auth_and_server_errors() {
        let body = r#"{"error": {"message": "Error validating access token", "code": 190}}"#;
        assert!(matches!(
            map_fetch_error(status_error(400, body, None)),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            map_fetch_error(status_error(401, "nope", None)),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            map_fetch_error(status_error(503, "", None)),
            SyncError::TransientNetwork(_)
        ));
        assert!(matches!(
            map_fetch_error(status_error(400, r#"{"error": {"message": "bad field", "code": 100}}"#, None)),
            SyncError::PermanentFailure(_)
        ));
    }

    #[test]
    fn insights_url_normalizes_account_prefix() {
        let fetcher = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let api = GraphInsightsApi::new(
            fetcher,
            GraphApiConfig {
                base_url: "https://graph.test/".into(),
                ..Default::default()
            },
        );
        assert_eq!(api.insights_url("act_42"), "https://graph.test/v19.0/act_42/insights");
        assert_eq!(api.insights_url("42"), "https://graph.test/v19.0/act_42/insights");
    }
}
