//! HTTP request handlers.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::client::{sanitize_input, ClientIp};
use crate::error::GatehouseError;
use crate::mqtt::{GatePublisher, GateRegistry};
use crate::ratelimit::RateLimiter;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub gates: Arc<GateRegistry>,
    pub publisher: Arc<dyn GatePublisher>,
    /// Upper bound on a single publish attempt inside a request
    pub publish_timeout: Duration,
}

/// Health check. Also serves every path without a dedicated route.
pub async fn health_check(
    State(state): State<AppState>,
    method: Method,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();

    if method != Method::GET {
        error!(method = %method, ip = %ip, "Method not allowed");
        return method_not_allowed();
    }

    if let Some(rejection) = enforce_rate_limit(&state.rate_limiter, &ip, "Rate limit exceeded") {
        return rejection;
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(sanitize_input)
        .unwrap_or_default();

    let response = ok_response();

    info!(
        ip = %ip,
        user_agent = %user_agent,
        response_time_ms = elapsed_ms(started),
        "Health check request processed"
    );
    response
}

/// Publish the configured message for the gate named in `?gate=`.
///
/// Publishing is best effort: a broker failure is logged and the caller
/// still receives 200.
pub async fn publish_gate(
    State(state): State<AppState>,
    method: Method,
    ClientIp(ip): ClientIp,
    uri: Uri,
) -> Response {
    let started = Instant::now();

    if method != Method::GET {
        error!(method = %method, ip = %ip, "MQTT publish: Method not allowed");
        return method_not_allowed();
    }

    if let Some(rejection) =
        enforce_rate_limit(&state.rate_limiter, &ip, "MQTT publish: Rate limit exceeded")
    {
        return rejection;
    }

    let Some(requested) = first_query_value(&uri, "gate").filter(|gate| !gate.is_empty()) else {
        error!(ip = %ip, "MQTT publish: Missing gate parameter");
        return StatusCode::BAD_REQUEST.into_response();
    };
    let gate = sanitize_input(&requested);

    let target = match state.gates.get(&requested) {
        Ok(target) => target,
        Err(_) => {
            error!(ip = %ip, gate = %gate, "MQTT publish: Invalid gate value");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    info!(
        ip = %ip,
        gate = %gate,
        topic = %target.topic,
        payload = %target.payload,
        "MQTT publish: Attempting to publish"
    );

    let outcome = tokio::time::timeout(
        state.publish_timeout,
        state.publisher.publish(&target.topic, &target.payload),
    )
    .await
    .unwrap_or_else(|_| {
        Err(GatehouseError::Mqtt(format!(
            "publish did not complete within {:?}",
            state.publish_timeout
        )))
    });

    match outcome {
        Ok(()) => info!(
            ip = %ip,
            gate = %gate,
            topic = %target.topic,
            payload = %target.payload,
            "MQTT message queued for delivery"
        ),
        Err(e) => error!(
            ip = %ip,
            gate = %gate,
            topic = %target.topic,
            payload = %target.payload,
            error = %e,
            "MQTT publish: Failed to publish message"
        ),
    }

    let response = ok_response();

    info!(
        ip = %ip,
        gate = %gate,
        topic = %target.topic,
        payload = %target.payload,
        response_time_ms = elapsed_ms(started),
        "MQTT publish request processed"
    );
    response
}

/// Returns a 429 response when `ip` is over its quota.
fn enforce_rate_limit(limiter: &RateLimiter, ip: &str, message: &'static str) -> Option<Response> {
    if limiter.is_allowed(ip) {
        return None;
    }

    let retry_after = retry_after_secs(limiter.retry_after(ip, Instant::now()));
    error!(ip = %ip, retry_after_secs = retry_after, "{}", message);

    Some(
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.to_string())],
        )
            .into_response(),
    )
}

/// First value of `key` in the query string, ignoring any repeats.
fn first_query_value(uri: &Uri, key: &str) -> Option<String> {
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(uri).ok()?;
    pairs.into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Whole seconds until capacity frees up, rounded up and at least one.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [
            (header::ALLOW, "GET"),
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
        ],
        "Method not allowed\n",
    )
        .into_response()
}

fn ok_response() -> Response {
    (
        StatusCode::OK,
        [
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            (header::X_FRAME_OPTIONS, "DENY"),
            (header::X_XSS_PROTECTION, "1; mode=block"),
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
        ],
        "OK",
    )
        .into_response()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::error::{GatehouseError, Result};
    use crate::http::server::router;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl GatePublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
            if self.fail {
                return Err(GatehouseError::Mqtt("broker unavailable".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn gates() -> GateRegistry {
        let mut gates = BTreeMap::new();
        for name in ["gate1", "gate2"] {
            gates.insert(
                name.to_string(),
                GateConfig {
                    topic: format!("home/{}/set", name),
                    payload: "OPEN".to_string(),
                },
            );
        }
        GateRegistry::new(gates)
    }

    /// Never finishes a publish within any test's patience.
    struct StalledPublisher;

    #[async_trait]
    impl GatePublisher for StalledPublisher {
        async fn publish(&self, _topic: &str, _payload: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn state(quota: usize, publisher: Arc<dyn GatePublisher>) -> AppState {
        AppState {
            rate_limiter: Arc::new(RateLimiter::new(quota, Duration::from_secs(60)).unwrap()),
            gates: Arc::new(gates()),
            publisher,
            publish_timeout: Duration::from_secs(1),
        }
    }

    fn app(quota: usize, publisher: Arc<RecordingPublisher>) -> Router {
        router(state(quota, publisher), Duration::from_secs(5))
    }

    fn get(uri: &str, ip: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", ip)
            .header(header::USER_AGENT, "test-agent\t1")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_ok_with_security_headers() {
        let app = app(10, Arc::default());

        let response = app.oneshot(get("/", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let h = response.headers();
        assert_eq!(h[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(h[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(h[header::X_XSS_PROTECTION], "1; mode=block");
        assert_eq!(h[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn test_unrouted_path_is_health_check() {
        let app = app(10, Arc::default());

        let response = app.oneshot(get("/status/anything", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let app = app(10, Arc::default());

        for uri in ["/", "/mqtt?gate=gate1"] {
            let request = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(response.headers()[header::ALLOW], "GET");
            assert_eq!(body_string(response).await, "Method not allowed\n");
        }
    }

    #[tokio::test]
    async fn test_rate_limit_per_client() {
        let app = app(2, Arc::default());

        for _ in 0..2 {
            let response = app.clone().oneshot(get("/", "1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry));
        assert_eq!(body_string(response).await, "");

        let response = app.oneshot(get("/", "5.6.7.8")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limit_shared_across_endpoints() {
        let publisher = Arc::new(RecordingPublisher::default());
        let app = app(1, Arc::clone(&publisher));

        let response = app.clone().oneshot(get("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/mqtt?gate=gate1", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_gate() {
        let publisher = Arc::new(RecordingPublisher::default());
        let app = app(10, Arc::clone(&publisher));

        let response = app.oneshot(get("/mqtt?gate=gate2", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(body_string(response).await, "OK");
        assert_eq!(
            *publisher.sent.lock().unwrap(),
            vec![("home/gate2/set".to_string(), "OPEN".to_string())]
        );
    }

    #[tokio::test]
    async fn test_publish_missing_gate() {
        let publisher = Arc::new(RecordingPublisher::default());
        let app = app(10, Arc::clone(&publisher));

        for uri in ["/mqtt", "/mqtt?gate=", "/mqtt?other=1"] {
            let response = app.clone().oneshot(get(uri, "1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri {}", uri);
        }
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_unknown_gate() {
        let publisher = Arc::new(RecordingPublisher::default());
        let app = app(10, Arc::clone(&publisher));

        let response = app.oneshot(get("/mqtt?gate=gate9", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_still_ok() {
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let app = app(10, publisher);

        let response = app.oneshot(get("/mqtt?gate=gate1", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn test_stalled_publish_still_ok_within_request_timeout() {
        let mut state = state(10, Arc::new(StalledPublisher));
        state.publish_timeout = Duration::from_millis(100);
        let app = router(state, Duration::from_millis(500));

        let response = app.oneshot(get("/mqtt?gate=gate1", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn test_repeated_gate_uses_first_value() {
        let publisher = Arc::new(RecordingPublisher::default());
        let app = app(10, Arc::clone(&publisher));

        let response = app
            .oneshot(get("/mqtt?gate=gate1&gate=gate2", "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *publisher.sent.lock().unwrap(),
            vec![("home/gate1/set".to_string(), "OPEN".to_string())]
        );
    }

    #[tokio::test]
    async fn test_gate_with_control_characters_is_rejected() {
        let publisher = Arc::new(RecordingPublisher::default());
        let app = app(10, Arc::clone(&publisher));

        for uri in ["/mqtt?gate=gate1%0A", "/mqtt?gate=gate1%09", "/mqtt?gate=%0Dgate1"] {
            let response = app.clone().oneshot(get(uri, "1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri {}", uri);
        }
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    /// Records the level of every event emitted while installed.
    #[derive(Clone, Default)]
    struct Levels(Arc<Mutex<Vec<tracing::Level>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Levels {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    #[tokio::test]
    async fn test_rejections_log_at_error_level() {
        use tracing_subscriber::layer::SubscriberExt;

        let levels = Levels::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(levels.clone()));
        let app = app(1, Arc::default());

        let post = Request::builder()
            .method(Method::POST)
            .uri("/mqtt?gate=gate1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(post).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        app.clone().oneshot(get("/", "1.2.3.4")).await.unwrap();
        let response = app.oneshot(get("/", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let levels = levels.0.lock().unwrap();
        assert_eq!(
            levels.iter().filter(|l| **l == tracing::Level::ERROR).count(),
            2
        );
        assert!(!levels.contains(&tracing::Level::WARN));
    }

    #[test]
    fn test_first_query_value() {
        let uri: Uri = "/mqtt?other=1&gate=a&gate=b".parse().unwrap();
        assert_eq!(first_query_value(&uri, "gate").as_deref(), Some("a"));
        assert_eq!(first_query_value(&uri, "missing"), None);

        let bare: Uri = "/mqtt".parse().unwrap();
        assert_eq!(first_query_value(&bare, "gate"), None);
    }

    #[tokio::test]
    async fn test_unknown_client_shares_one_bucket() {
        let app = app(1, Arc::default());
        let bare = || Request::builder().uri("/").body(Body::empty()).unwrap();

        assert_eq!(app.clone().oneshot(bare()).await.unwrap().status(), StatusCode::OK);
        assert_eq!(
            app.oneshot(bare()).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(40)), 40);
    }
}
