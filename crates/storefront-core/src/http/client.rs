//! Backend API client.
//!
//! Every call goes through the same pipeline:
//!
//! 1. identical concurrent GETs are collapsed by the dedup cache
//! 2. the credential is attached (or the call fails `Unauthenticated`)
//! 3. the request waits for admission in the rate-limited queue
//! 4. the response is classified; 429 pauses the queue and retries, 401
//!    triggers one shared token refresh and one resubmission

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{DedupCache, RequestDescriptor, RequestQueue};
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::store::{BackendToken, CredentialVault};

/// Obtains a replacement backend token after an authorization failure.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_backend_token(&self) -> Option<BackendToken>;
}

/// Retry context for one logical request.
///
/// Values are never mutated; each retry derives the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attempt {
    pub number: u32,
    pub overload_retries: u32,
    pub reauthenticated: bool,
}

impl Attempt {
    pub fn first() -> Self {
        Self {
            number: 1,
            ..Self::default()
        }
    }

    pub fn retry_after_overload(self) -> Self {
        Self {
            number: self.number + 1,
            overload_retries: self.overload_retries + 1,
            ..self
        }
    }

    pub fn retry_after_refresh(self) -> Self {
        Self {
            number: self.number + 1,
            reauthenticated: true,
            ..self
        }
    }
}

/// A successful backend response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }
}

/// Seconds form of `Retry-After`. The HTTP-date form falls back to the
/// default pause.
fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with("<!DOCTYPE") || head.starts_with("<!doctype") || head.starts_with("<html")
}

/// API client for the storefront backend.
/// Clone is cheap; all clones share the queue, dedup cache and connection pool.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    config: Arc<ClientConfig>,
    queue: RequestQueue,
    dedup: DedupCache<ApiResponse>,
    vault: CredentialVault,
    refresher: Arc<dyn TokenRefresher>,
}

impl ApiClient {
    pub fn new(
        http: Client,
        config: Arc<ClientConfig>,
        queue: RequestQueue,
        vault: CredentialVault,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            http,
            config,
            queue,
            dedup: DedupCache::new(),
            vault,
            refresher,
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Send a request through the pipeline.
    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<ApiResponse, ApiError> {
        match descriptor.dedup_key() {
            Some(key) => {
                let client = self.clone();
                self.dedup
                    .dedup(&key, move || async move { client.execute(descriptor).await })
                    .await
            }
            None => self.execute(descriptor).await,
        }
    }

    /// Send a request and decode the JSON response body.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<T, ApiError> {
        self.request(descriptor).await?.json()
    }

    async fn execute(&self, descriptor: RequestDescriptor) -> Result<ApiResponse, ApiError> {
        let descriptor = Arc::new(descriptor);
        let mut attempt = Attempt::first();

        loop {
            let bearer = self.credential_for(&descriptor).await?;
            match self.submit(&descriptor, bearer.clone()).await {
                Err(ApiError::Overloaded { retry_after }) => {
                    let pause = retry_after.unwrap_or_else(|| self.config.default_overload_pause());
                    self.queue.set_rate_limited(pause);
                    if attempt.overload_retries >= self.config.max_overload_retries {
                        warn!(
                            path = descriptor.path(),
                            attempts = attempt.number,
                            "Giving up after repeated overload responses"
                        );
                        return Err(ApiError::Overloaded { retry_after });
                    }
                    debug!(
                        path = descriptor.path(),
                        pause_ms = pause.as_millis() as u64,
                        "Overloaded, retrying after pause"
                    );
                    attempt = attempt.retry_after_overload();
                }
                Err(ApiError::Unauthorized)
                    if descriptor.requires_auth()
                        && !descriptor.is_admin_scope()
                        && !attempt.reauthenticated =>
                {
                    if self.token_replaced(bearer.as_deref()).await {
                        debug!(path = descriptor.path(), "Token replaced while in flight, resending");
                        attempt = attempt.retry_after_refresh();
                        continue;
                    }
                    info!(path = descriptor.path(), "Unauthorized, refreshing backend token");
                    match self.refresher.refresh_backend_token().await {
                        Some(_) => attempt = attempt.retry_after_refresh(),
                        None => return Err(ApiError::Unauthorized),
                    }
                }
                other => return other,
            }
        }
    }

    /// Whether the vault now holds a different bearer than the one sent,
    /// i.e. a refresh already finished after this request went out.
    async fn token_replaced(&self, sent: Option<&str>) -> bool {
        match self.vault.bearer().await {
            Ok(Some(current)) => Some(current.as_str()) != sent,
            _ => false,
        }
    }

    async fn credential_for(&self, descriptor: &RequestDescriptor) -> Result<Option<String>, ApiError> {
        let stored = if descriptor.is_admin_scope() {
            self.vault.admin_token().await
        } else {
            self.vault.bearer().await
        };
        let token = stored.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read stored credential");
            None
        });

        if token.is_none() && descriptor.requires_auth() {
            debug!(path = descriptor.path(), "No credential for authenticated request");
            return Err(ApiError::Unauthenticated);
        }
        Ok(token)
    }

    async fn submit(
        &self,
        descriptor: &Arc<RequestDescriptor>,
        bearer: Option<String>,
    ) -> Result<ApiResponse, ApiError> {
        let http = self.http.clone();
        let url = self.config.api_url(descriptor.path());
        let descriptor = Arc::clone(descriptor);
        self.queue
            .enqueue(move || async move { send(http, url, &descriptor, bearer).await })
            .await
    }
}

async fn send(
    http: Client,
    url: String,
    descriptor: &RequestDescriptor,
    bearer: Option<String>,
) -> Result<ApiResponse, ApiError> {
    let mut request = http
        .request(descriptor.method().clone(), &url)
        .header(header::ACCEPT, "application/json");
    if !descriptor.query_pairs().is_empty() {
        request = request.query(descriptor.query_pairs());
    }
    if let Some(body) = descriptor.body() {
        request = request.json(body);
    }
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| ApiError::from_transport(&e))?;
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.map_err(|e| ApiError::from_transport(&e))?;
    debug!(method = %descriptor.method(), path = descriptor.path(), status = status.as_u16(), "Response");

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ApiError::Overloaded { retry_after });
    }
    if !status.is_success() {
        let err = ApiError::from_status(status, &body);
        warn!(path = descriptor.path(), status = status.as_u16(), error = %err, "Request failed");
        return Err(err);
    }
    if looks_like_html(&body) {
        return Err(ApiError::InvalidResponse(
            "Server returned HTML instead of JSON".to_string(),
        ));
    }
    Ok(ApiResponse { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCredentialStore, UserProfile};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Hands out a fixed token and counts calls.
    struct FixedRefresher {
        vault: CredentialVault,
        token: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for FixedRefresher {
        async fn refresh_backend_token(&self) -> Option<BackendToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let token = BackendToken {
                token: self.token?.to_string(),
                profile: profile(),
            };
            self.vault.store_backend_token(&token).await.ok()?;
            Some(token)
        }
    }

    fn profile() -> UserProfile {
        UserProfile {
            id: "u-1".to_string(),
            email: None,
            phone: None,
            display_name: None,
        }
    }

    struct Harness {
        client: ApiClient,
        vault: CredentialVault,
        refresher: Arc<FixedRefresher>,
    }

    fn harness(server: &MockServer, refreshed: Option<&'static str>) -> Harness {
        harness_with(server.uri(), refreshed, Client::new())
    }

    fn harness_with(base_url: String, refreshed: Option<&'static str>, http: Client) -> Harness {
        let config = ClientConfig {
            api_base_url: base_url,
            max_overload_retries: 2,
            default_overload_pause_ms: 10,
            ..ClientConfig::default()
        };
        let vault = CredentialVault::new(Arc::new(MemoryCredentialStore::new()));
        let refresher = Arc::new(FixedRefresher {
            vault: vault.clone(),
            token: refreshed,
            calls: AtomicUsize::new(0),
        });
        let queue = RequestQueue::new(config.max_requests_per_second, config.drain_retry_delay());
        let client = ApiClient::new(
            http,
            Arc::new(config),
            queue,
            vault.clone(),
            refresher.clone(),
        );
        Harness {
            client,
            vault,
            refresher,
        }
    }

    async fn sign_in(vault: &CredentialVault, token: &str) {
        vault
            .store_backend_token(&BackendToken {
                token: token.to_string(),
                profile: profile(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_identical_gets_share_one_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"items": [1, 2, 3]}))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, None);
        let calls = (0..5).map(|_| h.client.request(RequestDescriptor::get("items?page=1")));
        let results = futures::future::join_all(calls).await;

        assert_eq!(results.len(), 5);
        for result in results {
            let body: serde_json::Value = result.unwrap().json().unwrap();
            assert_eq!(body["items"], json!([1, 2, 3]));
        }
    }

    #[tokio::test]
    async fn test_authenticated_call_without_token_never_sends() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(&server, None);
        let result = h.client.request(RequestDescriptor::get("api/orders").authenticated()).await;
        assert_eq!(result.unwrap_err(), ApiError::Unauthenticated);
    }

    #[tokio::test]
    async fn test_public_call_works_without_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/products"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, None);
        let products: Vec<serde_json::Value> = h
            .client
            .request_json(RequestDescriptor::get("api/products"))
            .await
            .unwrap();
        assert!(products.is_empty());
    }

    #[tokio::test]
    async fn test_bearer_attached_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/cart"))
            .and(header_eq("authorization", "Bearer jwt-1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, None);
        sign_in(&h.vault, "jwt-1").await;
        let response = h
            .client
            .request(RequestDescriptor::post("api/cart").json(json!({"sku": "A1"})).authenticated())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/profile"))
            .and(header_eq("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/profile"))
            .and(header_eq("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ada"})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, Some("fresh"));
        sign_in(&h.vault, "stale").await;
        let body: serde_json::Value = h
            .client
            .request_json(RequestDescriptor::get("api/profile").authenticated())
            .await
            .unwrap();
        assert_eq!(body["name"], "Ada");
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_unauthorized_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let h = harness(&server, Some("still-bad"));
        sign_in(&h.vault, "stale").await;
        let result = h.client.request(RequestDescriptor::get("api/profile").authenticated()).await;
        assert_eq!(result.unwrap_err(), ApiError::Unauthorized);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_surfaces_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, None);
        sign_in(&h.vault, "stale").await;
        let result = h.client.request(RequestDescriptor::get("api/profile").authenticated()).await;
        assert_eq!(result.unwrap_err(), ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn test_admin_scope_is_not_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_eq("authorization", "Bearer admin-1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, Some("fresh"));
        h.vault.store_admin_token("admin-1").await.unwrap();
        let result = h.client.request(RequestDescriptor::get("api/admin/orders").admin()).await;
        assert_eq!(result.unwrap_err(), ApiError::Unauthorized);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_overload_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let h = harness(&server, None);
        let result = h.client.request(RequestDescriptor::get("api/products")).await;
        assert!(matches!(result, Err(ApiError::Overloaded { .. })));
    }

    #[tokio::test]
    async fn test_overload_honours_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let h = harness(&server, None);
        let started = std::time::Instant::now();
        let response = h.client.request(RequestDescriptor::get("api/products")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_html_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<!DOCTYPE html><html></html>"))
            .mount(&server)
            .await;

        let h = harness(&server, None);
        let result = h.client.request(RequestDescriptor::get("api/products")).await;
        assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_unauthorized_after_refresh_settled_reuses_new_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/orders"))
            .and(header_eq("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(150)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/orders"))
            .and(header_eq("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, Some("unused"));
        sign_in(&h.vault, "stale").await;
        let (result, ()) = tokio::join!(
            h.client.request(RequestDescriptor::get("api/orders").authenticated()),
            async {
                // Another caller's refresh lands while this request is in flight
                tokio::time::sleep(Duration::from_millis(30)).await;
                sign_in(&h.vault, "fresh").await;
            }
        );

        assert_eq!(result.unwrap().status, StatusCode::OK);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_fault_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/products"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({"message": "database down"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, Some("fresh"));
        sign_in(&h.vault, "jwt-1").await;
        let result = h.client.request(RequestDescriptor::get("api/products").authenticated()).await;
        assert_eq!(result.unwrap_err(), ApiError::ServerFault("database down".to_string()));
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_response_times_out_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let http = Client::builder().timeout(Duration::from_millis(100)).build().unwrap();
        let h = harness_with(server.uri(), None, http);
        let result = h.client.request(RequestDescriptor::get("api/products")).await;
        assert_eq!(result.unwrap_err(), ApiError::Timeout);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let h = harness_with("http://127.0.0.1:9".to_string(), Some("fresh"), Client::new());
        sign_in(&h.vault, "jwt-1").await;
        let result = h.client.request(RequestDescriptor::get("api/products").authenticated()).await;
        assert!(matches!(result, Err(ApiError::NetworkUnavailable(_))));
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attempt_is_immutable() {
        let first = Attempt::first();
        let overload = first.retry_after_overload();
        let refreshed = overload.retry_after_refresh();
        assert_eq!(first, Attempt { number: 1, overload_retries: 0, reauthenticated: false });
        assert_eq!(overload.overload_retries, 1);
        assert_eq!(refreshed.number, 3);
        assert!(refreshed.reauthenticated);
        assert_eq!(refreshed.overload_retries, 1);
    }
}
