//! Transport Dispatcher
//!
//! Sends one [`OutgoingRequest`] with the provider-wide headers injected,
//! applies the per-call timeout, and retries transient failures with backoff.
//! Conflicts (409/412) are returned to the caller untouched: resending the
//! same body with a stale etag cannot succeed, so the re-read belongs to the
//! caller (see [`crate::iam::manager`]).

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::USER_AGENT;
use reqwest::{Client, Method};
use serde_json::Value;

use super::auth::Authenticator;
use super::billing::quota_project_header;
use super::retry::{CallContext, RetryPolicy};
use crate::config::ResolvedConfig;
use crate::error::{ApiError, Error, ErrorKind, Result};

pub const REQUEST_REASON_HEADER: &str = "X-Goog-Request-Reason";
pub const USER_PROJECT_HEADER: &str = "X-Goog-User-Project";

/// Timeout applied when `request_timeout` is zero.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Truncate and strip control characters before a body reaches the log.
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };
    truncated.replace(|c: char| c.is_control(), "")
}

/// Extra retry condition attached to a single request.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// One API call as produced by a resource implementation.
#[derive(Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    /// Router decision for the quota project; see [`crate::gcp::billing`].
    pub billing_project: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Per-request override of the provider's request timeout.
    pub timeout: Option<Duration>,
    pub operation: String,
    pub target: String,
    pub retry_count: u32,
    pub retry_predicates: Vec<RetryPredicate>,
}

impl std::fmt::Debug for OutgoingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("billing_project", &self.billing_project)
            .field("timeout", &self.timeout)
            .field("operation", &self.operation)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

impl OutgoingRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            operation: method.to_string(),
            target: url.clone(),
            method,
            url,
            body: None,
            billing_project: None,
            headers: Vec::new(),
            timeout: None,
            retry_count: 0,
            retry_predicates: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_billing_project(mut self, project: Option<String>) -> Self {
        self.billing_project = project;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Name the call for error reports.
    pub fn with_operation(mut self, operation: impl Into<String>, target: impl Into<String>) -> Self {
        self.operation = operation.into();
        self.target = target.into();
        self
    }

    pub fn with_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_predicates.push(Arc::new(predicate));
        self
    }

    fn is_retryable(&self, err: &Error) -> bool {
        match err.kind() {
            ErrorKind::Transient => true,
            ErrorKind::Cancelled | ErrorKind::Validation | ErrorKind::Authentication => false,
            ErrorKind::Conflict | ErrorKind::Fatal => self.retry_predicates.iter().any(|p| p(err)),
        }
    }
}

/// Issues requests on behalf of one provider activation.
#[derive(Clone)]
pub struct Dispatcher {
    client: Client,
    user_agent: String,
    request_reason: Option<String>,
    request_timeout: Duration,
    quota_project_env: Option<String>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(config: &ResolvedConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent())
            .build()
            .map_err(Error::Network)?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &ResolvedConfig) -> Self {
        Self {
            client,
            user_agent: config.user_agent().to_string(),
            request_reason: config.request_reason().map(str::to_string),
            request_timeout: config.request_timeout(),
            quota_project_env: config.quota_project_env().map(str::to_string),
            retry: RetryPolicy::transport_default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn http_client(&self) -> &Client {
        &self.client
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Per-attempt timeout: the request's own, else the provider's (120s when
    /// zero), capped by the caller's remaining deadline.
    pub fn effective_timeout(&self, request: &OutgoingRequest, ctx: &CallContext) -> Duration {
        let base = request
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(if self.request_timeout.is_zero() {
                DEFAULT_REQUEST_TIMEOUT
            } else {
                self.request_timeout
            });
        match ctx.remaining() {
            Some(remaining) => base.min(remaining),
            None => base,
        }
    }

    /// Send a request, retrying transient failures.
    ///
    /// Returns the decoded JSON body (`Value::Null` for an empty body).
    pub async fn send(
        &self,
        auth: &Authenticator,
        mut request: OutgoingRequest,
        ctx: &CallContext,
    ) -> Result<Value> {
        let mut backoff = self.retry.backoff.start();
        loop {
            ctx.check()?;
            let token = ctx.run(auth.get_token()).await?;
            let timeout = self.effective_timeout(&request, ctx);

            let err = match ctx.run(self.attempt(&request, &token, timeout)).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            ctx.check()?;
            let attempts = request.retry_count + 1;
            if !request.is_retryable(&err) {
                return Err(err);
            }
            if !self.retry.allows_another(attempts) {
                return Err(Error::Exhausted {
                    operation: request.operation.clone(),
                    target: request.target.clone(),
                    attempts,
                    source: Box::new(err),
                });
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                "{} {} attempt {} failed ({}), retrying in {:?}",
                request.method,
                request.url,
                attempts,
                err,
                delay
            );
            ctx.sleep(delay).await?;
            request.retry_count = attempts;
        }
    }

    async fn attempt(&self, request: &OutgoingRequest, token: &str, timeout: Duration) -> Result<Value> {
        tracing::debug!("{} {}", request.method, request.url);

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .bearer_auth(token)
            .timeout(timeout)
            .header(USER_AGENT, &self.user_agent);

        if let Some(reason) = &self.request_reason {
            builder = builder.header(REQUEST_REASON_HEADER, reason);
        }
        if let Some(project) = quota_project_header(
            request.billing_project.as_deref(),
            self.quota_project_env.as_deref(),
        ) {
            builder = builder.header(USER_PROJECT_HEADER, project);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(timeout)
            } else {
                Error::Network(e)
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(timeout)
            } else {
                Error::Network(e)
            }
        })?;

        if !status.is_success() {
            // Only a sanitized, truncated body reaches the log.
            tracing::error!("API error: {} - {}", status, sanitize_for_log(&body));
            return Err(ApiError::from_response(status.as_u16(), body).into());
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environment, ProviderBlock};
    use crate::gcp::endpoints::StaticMtlsDetector;

    fn dispatcher(block: ProviderBlock) -> Dispatcher {
        let config =
            ResolvedConfig::resolve(&block, &Environment::empty(), &StaticMtlsDetector(false)).unwrap();
        Dispatcher::new(&config).unwrap()
    }

    #[test]
    fn test_sanitize_for_log_truncates() {
        let long = "x".repeat(500);
        let out = sanitize_for_log(&long);
        assert!(out.contains("[truncated, 500 bytes total]"));
        assert_eq!(sanitize_for_log("a\nb"), "ab");
    }

    #[test]
    fn test_zero_timeout_means_default() {
        let d = dispatcher(ProviderBlock::default());
        let req = OutgoingRequest::get("https://example.com/");
        assert_eq!(d.effective_timeout(&req, &CallContext::new()), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_sub_second_timeout_is_honoured() {
        let d = dispatcher(ProviderBlock {
            request_timeout: Some("250ms".into()),
            ..Default::default()
        });
        let req = OutgoingRequest::get("https://example.com/");
        assert_eq!(
            d.effective_timeout(&req, &CallContext::new()),
            Duration::from_millis(250)
        );
        let req = req.with_timeout(Duration::from_secs(5));
        assert_eq!(d.effective_timeout(&req, &CallContext::new()), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_caps_timeout() {
        let d = dispatcher(ProviderBlock::default());
        let ctx = CallContext::new().with_timeout(Duration::from_secs(10));
        let req = OutgoingRequest::get("https://example.com/");
        assert_eq!(d.effective_timeout(&req, &ctx), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_predicates_extend_but_never_cover_cancellation() {
        let req = OutgoingRequest::get("https://example.com/").with_retry_predicate(|e| e.status() == Some(400));
        assert!(req.is_retryable(&Error::Api(ApiError::from_response(400, ""))));
        assert!(req.is_retryable(&Error::Api(ApiError::from_response(503, ""))));
        assert!(!req.is_retryable(&Error::Api(ApiError::from_response(404, ""))));
        assert!(!req.is_retryable(&Error::Cancelled));
        let plain = OutgoingRequest::get("https://example.com/");
        assert!(!plain.is_retryable(&Error::Api(ApiError::from_response(409, ""))));
    }
}
