//! HTTP client for a remote x402 facilitator.
//!
//! This [`FacilitatorClient`] handles the `POST /verify`, `POST /settle`, and
//! `GET /supported` endpoints of a remote facilitator and implements the
//! [`Facilitator`] trait for use by the payment gate.
//!
//! Every call passes through a circuit breaker, so a failing facilitator is
//! shed quickly instead of stacking timeouts. Upstream failures are mapped to
//! a small fixed set of categories before they reach the caller: raw response
//! bodies and transport error text never cross this boundary and are only
//! written to the `tracing` log.
//!
//! ## Example
//!
//! ```rust
//! use x402_guard::facilitator_client::FacilitatorClient;
//!
//! let facilitator = FacilitatorClient::try_from("https://facilitator.x402.rs").unwrap();
//! ```

use http::{HeaderMap, StatusCode};
use reqwest::Client;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::{Host, Url};

use crate::circuit_breaker::CircuitBreaker;
use crate::facilitator::{Facilitator, FacilitatorFault};
use crate::types::{
    SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse,
};

/// TTL cache entry for [`SupportedResponse`].
#[derive(Clone, Debug)]
struct SupportedCacheState {
    /// The cached response
    response: SupportedResponse,
    /// When the cache expires
    expires_at: std::time::Instant,
}

/// An encapsulated TTL cache for the `/supported` endpoint response.
///
/// Each clone has an independent cache state.
#[derive(Debug)]
pub struct SupportedCache {
    /// TTL for the cache
    ttl: Duration,
    /// Cache state (RwLock for read-heavy workload)
    state: RwLock<Option<SupportedCacheState>>,
}

impl SupportedCache {
    /// Creates a new cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Returns the cached response if valid, None otherwise.
    pub async fn get(&self) -> Option<SupportedResponse> {
        let guard = self.state.read().await;
        let cache = guard.as_ref()?;
        if std::time::Instant::now() < cache.expires_at {
            Some(cache.response.clone())
        } else {
            None
        }
    }

    /// Stores a response in the cache with the configured TTL.
    pub async fn set(&self, response: SupportedResponse) {
        let mut guard = self.state.write().await;
        *guard = Some(SupportedCacheState {
            response,
            expires_at: std::time::Instant::now() + self.ttl,
        });
    }

    /// Clears the cache.
    pub async fn clear(&self) {
        let mut guard = self.state.write().await;
        *guard = None;
    }
}

impl Clone for SupportedCache {
    fn clone(&self) -> Self {
        Self::new(self.ttl)
    }
}

/// Safe categories for upstream facilitator failures.
///
/// These are the only shapes in which a non-2xx facilitator response is
/// reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorCategory {
    /// The facilitator rejected the request as malformed (400).
    BadRequest,
    /// The facilitator rejected this server's credentials (401/403).
    AuthFailure,
    /// The endpoint does not exist at the facilitator (404).
    NotFound,
    /// The facilitator throttled this server (429).
    RateLimited,
    /// The facilitator failed internally (5xx).
    UpstreamUnavailable,
    /// Any other unexpected status.
    Unknown,
}

impl UpstreamErrorCategory {
    fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_REQUEST => UpstreamErrorCategory::BadRequest,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamErrorCategory::AuthFailure,
            StatusCode::NOT_FOUND => UpstreamErrorCategory::NotFound,
            StatusCode::TOO_MANY_REQUESTS => UpstreamErrorCategory::RateLimited,
            _ if status.is_server_error() => UpstreamErrorCategory::UpstreamUnavailable,
            _ => UpstreamErrorCategory::Unknown,
        }
    }

    /// Whether this category is evidence of facilitator ill-health for the
    /// circuit breaker. 4xx responses mean the facilitator is alive and
    /// judged our request, so they do not trip the circuit.
    fn is_facilitator_fault(&self) -> bool {
        matches!(
            self,
            UpstreamErrorCategory::UpstreamUnavailable | UpstreamErrorCategory::Unknown
        )
    }
}

impl Display for UpstreamErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpstreamErrorCategory::BadRequest => "bad_request",
            UpstreamErrorCategory::AuthFailure => "auth_failure",
            UpstreamErrorCategory::NotFound => "not_found",
            UpstreamErrorCategory::RateLimited => "rate_limited",
            UpstreamErrorCategory::UpstreamUnavailable => "upstream_unavailable",
            UpstreamErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur while interacting with a remote facilitator.
///
/// Variants deliberately carry no upstream response text; full detail is
/// logged at the point of failure.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    /// The facilitator URL uses a scheme other than https (http is allowed
    /// for loopback hosts only).
    #[error("Insecure facilitator URL: https is required for non-loopback hosts")]
    InsecureUrl,
    /// The circuit breaker refused the call without attempting transport.
    #[error("Facilitator circuit breaker is open")]
    CircuitOpen,
    /// The request never produced an HTTP response.
    #[error("Facilitator request failed: {context}")]
    Transport { context: &'static str },
    /// The facilitator answered with a non-success status.
    #[error("Facilitator returned an error: {context}: {category}")]
    Upstream {
        context: &'static str,
        category: UpstreamErrorCategory,
    },
    /// The facilitator answered 2xx but the body did not decode.
    #[error("Facilitator response could not be decoded: {context}")]
    Decode { context: &'static str },
}

impl FacilitatorClientError {
    /// Whether this failure should count against the circuit breaker.
    fn is_facilitator_fault(&self) -> bool {
        match self {
            FacilitatorClientError::Transport { .. } | FacilitatorClientError::Decode { .. } => {
                true
            }
            FacilitatorClientError::Upstream { category, .. } => category.is_facilitator_fault(),
            FacilitatorClientError::UrlParse { .. }
            | FacilitatorClientError::InsecureUrl
            | FacilitatorClientError::CircuitOpen => false,
        }
    }
}

impl FacilitatorFault for FacilitatorClientError {
    fn is_circuit_open(&self) -> bool {
        matches!(self, FacilitatorClientError::CircuitOpen)
    }
}

/// A client for communicating with a remote x402 facilitator.
///
/// Handles `/verify`, `/settle`, and `/supported` endpoints via JSON HTTP.
/// Clones share the circuit breaker (one facilitator, one health picture per
/// process) but keep independent `/supported` caches.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    /// Base URL of the facilitator (e.g. `https://facilitator.example/`)
    base_url: Url,
    /// Full URL to `POST /verify` requests
    verify_url: Url,
    /// Full URL to `POST /settle` requests
    settle_url: Url,
    /// Full URL to `GET /supported` requests
    supported_url: Url,
    /// Shared Reqwest HTTP client
    client: Client,
    /// Optional custom headers sent with each request
    headers: HeaderMap,
    /// Optional total request timeout
    timeout: Option<Duration>,
    /// Circuit breaker guarding all calls
    breaker: Arc<CircuitBreaker>,
    /// Cache for the supported endpoint response
    supported_cache: SupportedCache,
}

impl FacilitatorClient {
    /// Default TTL for caching the supported endpoint response (10 minutes).
    pub const DEFAULT_SUPPORTED_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

    /// Default circuit breaker policy: open after 5 consecutive failures,
    /// probe after 30 seconds, close after 2 consecutive successes.
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

    /// Returns the base URL used by this client.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the computed `./verify` URL relative to [`FacilitatorClient::base_url`].
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// Returns the computed `./settle` URL relative to [`FacilitatorClient::base_url`].
    pub fn settle_url(&self) -> &Url {
        &self.settle_url
    }

    /// Returns the computed `./supported` URL relative to [`FacilitatorClient::base_url`].
    pub fn supported_url(&self) -> &Url {
        &self.supported_url
    }

    /// Returns any custom headers configured on the client.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the configured total request timeout, if any.
    pub fn timeout(&self) -> &Option<Duration> {
        &self.timeout
    }

    /// Returns the circuit breaker guarding this client.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Constructs a new [`FacilitatorClient`] from a base URL.
    ///
    /// This sets up `./verify`, `./settle`, and `./supported` endpoint URLs
    /// relative to the base, and installs the default circuit breaker policy.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        assert_transport_security(&base_url)?;
        let client = Client::new();
        let verify_url =
            base_url
                .join("./verify")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./verify URL",
                    source: e,
                })?;
        let settle_url =
            base_url
                .join("./settle")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./settle URL",
                    source: e,
                })?;
        let supported_url =
            base_url
                .join("./supported")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./supported URL",
                    source: e,
                })?;
        Ok(Self {
            client,
            base_url,
            verify_url,
            settle_url,
            supported_url,
            headers: HeaderMap::new(),
            timeout: None,
            breaker: Arc::new(CircuitBreaker::new(
                Self::DEFAULT_FAILURE_THRESHOLD,
                Self::DEFAULT_RECOVERY_TIMEOUT,
                Self::DEFAULT_SUCCESS_THRESHOLD,
            )),
            supported_cache: SupportedCache::new(Self::DEFAULT_SUPPORTED_CACHE_TTL),
        })
    }

    /// Attaches custom headers to all future requests.
    pub fn with_headers(&self, headers: HeaderMap) -> Self {
        let mut this = self.clone();
        this.headers = headers;
        this
    }

    /// Sets a total timeout for all future requests.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.timeout = Some(timeout);
        this
    }

    /// Sets a connect timeout, separate from the total request timeout.
    ///
    /// Rebuilds the underlying HTTP client.
    pub fn with_connect_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        this
    }

    /// Replaces the circuit breaker policy.
    pub fn with_circuit_breaker(&self, breaker: CircuitBreaker) -> Self {
        let mut this = self.clone();
        this.breaker = Arc::new(breaker);
        this
    }

    /// Sets the TTL for caching the supported endpoint response.
    ///
    /// Default is 10 minutes. Use [`Self::without_supported_cache()`] to disable caching.
    pub fn with_supported_cache_ttl(&self, ttl: Duration) -> Self {
        let mut this = self.clone();
        this.supported_cache = SupportedCache::new(ttl);
        this
    }

    /// Disables caching for the supported endpoint.
    pub fn without_supported_cache(&self) -> Self {
        self.with_supported_cache_ttl(Duration::ZERO)
    }

    /// Sends a `POST /verify` request to the facilitator.
    pub async fn verify(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        self.guarded(self.post_json(&self.verify_url, "POST /verify", request))
            .await
    }

    /// Sends a `POST /settle` request to the facilitator.
    pub async fn settle(
        &self,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorClientError> {
        self.guarded(self.post_json(&self.settle_url, "POST /settle", request))
            .await
    }

    /// Sends a `GET /supported` request to the facilitator.
    /// This is the inner method that always makes an HTTP request.
    async fn supported_inner(&self) -> Result<SupportedResponse, FacilitatorClientError> {
        self.guarded(self.get_json(&self.supported_url, "GET /supported"))
            .await
    }

    /// Sends a `GET /supported` request to the facilitator.
    /// Results are cached with a configurable TTL (default: 10 minutes).
    pub async fn supported(&self) -> Result<SupportedResponse, FacilitatorClientError> {
        if let Some(response) = self.supported_cache.get().await {
            return Ok(response);
        }
        let response = self.supported_inner().await?;
        self.supported_cache.set(response.clone()).await;
        Ok(response)
    }

    /// Runs a request under the circuit breaker, recording the outcome.
    ///
    /// Responses that prove the facilitator alive (2xx, or a 4xx judgement)
    /// count as breaker successes; transport, decode, and 5xx failures count
    /// against it.
    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T, FacilitatorClientError>>,
    ) -> Result<T, FacilitatorClientError> {
        self.breaker
            .try_acquire()
            .map_err(|_| FacilitatorClientError::CircuitOpen)?;
        let result = fut.await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) if err.is_facilitator_fault() => self.breaker.record_failure(),
            Err(_) => self.breaker.record_success(),
        }
        result
    }

    /// Generic POST helper handling JSON serialization, error mapping, and
    /// timeout application.
    ///
    /// `context` identifies the call in logs and errors (e.g. `"POST /verify"`).
    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, FacilitatorClientError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.post(url.clone()).json(payload);
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req.send().await.map_err(|e| {
            tracing::warn!(error = %e, context, "Facilitator request failed");
            FacilitatorClientError::Transport { context }
        })?;
        Self::read_json(http_response, context).await
    }

    /// Generic GET helper handling error mapping and timeout application.
    async fn get_json<R>(
        &self,
        url: &Url,
        context: &'static str,
    ) -> Result<R, FacilitatorClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.get(url.clone());
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req.send().await.map_err(|e| {
            tracing::warn!(error = %e, context, "Facilitator request failed");
            FacilitatorClientError::Transport { context }
        })?;
        Self::read_json(http_response, context).await
    }

    /// Decodes a 2xx response body, or maps a non-success status to its safe
    /// category. The raw body goes to the log, never to the caller.
    async fn read_json<R>(
        response: reqwest::Response,
        context: &'static str,
    ) -> Result<R, FacilitatorClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        let status = response.status();
        if status.is_success() {
            response.json::<R>().await.map_err(|e| {
                tracing::warn!(error = %e, context, "Facilitator response decoding failed");
                FacilitatorClientError::Decode { context }
            })
        } else {
            let category = UpstreamErrorCategory::from_status(status);
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                %status,
                %category,
                context,
                body = %body,
                "Facilitator returned an error status"
            );
            Err(FacilitatorClientError::Upstream { context, category })
        }
    }
}

impl Facilitator for FacilitatorClient {
    type Error = FacilitatorClientError;

    async fn verify(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        FacilitatorClient::verify(self, request).await
    }

    async fn settle(
        &self,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorClientError> {
        FacilitatorClient::settle(self, request).await
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        FacilitatorClient::supported(self).await
    }
}

/// Requires https for any non-loopback facilitator host. http stays allowed
/// against loopback so local facilitators and test doubles work.
fn assert_transport_security(url: &Url) -> Result<(), FacilitatorClientError> {
    match url.scheme() {
        "https" => Ok(()),
        "http" => {
            let loopback = match url.host() {
                Some(Host::Ipv4(ip)) => ip.is_loopback(),
                Some(Host::Ipv6(ip)) => ip.is_loopback(),
                Some(Host::Domain(domain)) => domain == "localhost",
                None => false,
            };
            if loopback {
                Ok(())
            } else {
                Err(FacilitatorClientError::InsecureUrl)
            }
        }
        _ => Err(FacilitatorClientError::InsecureUrl),
    }
}

/// Converts a string URL into a `FacilitatorClient`, parsing the URL and calling `try_new`.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // Normalize: strip trailing slashes and add a single trailing slash
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        FacilitatorClient::try_new(url)
    }
}

/// Converts a String URL into a `FacilitatorClient`.
impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FacilitatorClient::try_from(value.as_str())
    }
}
