// Request pipeline and HTTP surface
// Ordered middleware chain (recovery, logging, CORS, auth, rate-limit,
// circuit-break, sampling, metrics) around the proxy handler, plus the
// health and admin endpoints
//
// Numan Thabit 2025 Nov

use crate::breaker::ClusterCircuitBreaker;
use crate::clustering::ClusteringEngine;
use crate::limiter::ClusterRateLimiter;
use crate::metrics;
use crate::sampler::{ErrorSampler, SampledFailure};
use crate::signature;
use crate::util;
use crate::vector_agent::VectorAgent;
use crate::watcher::PolicyWatcher;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info_span, Instrument};

#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<ClusterRateLimiter>,
    pub breaker: Arc<ClusterCircuitBreaker>,
    pub sampler: Arc<ErrorSampler>,
    pub vector_agent: Arc<VectorAgent>,
    pub watcher: Arc<PolicyWatcher>,
    pub clustering: Arc<ClusteringEngine>,
    pub upstream: Option<(reqwest::Client, url::Url)>,
    pub metrics_enabled: bool,
}

/// Cluster id resolved at admission time. Outcome recording uses this
/// exact id, so a snapshot refresh mid-request cannot skew the breaker.
#[derive(Clone)]
struct ClusterTag {
    cluster_id: String,
    route_key: String,
    service: String,
}

/// Error detail attached to locally-built failure responses so the
/// sampling layer sees more than a status code.
#[derive(Clone)]
struct ErrorDetail {
    message: String,
    frames: Vec<String>,
}

pub fn create_router(state: AppState) -> Router {
    // metrics sits closest to the handler: a request denied by the
    // limiter or breaker is never recorded, and the duration covers the
    // proxied call alone
    let api = Router::new()
        .route("/api/*path", any(proxy_handler))
        .route("/api", any(proxy_handler))
        .layer(middleware::from_fn(metrics_layer))
        .layer(middleware::from_fn_with_state(state.clone(), sampling_layer))
        .layer(middleware::from_fn_with_state(state.clone(), breaker_layer))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_layer))
        .layer(middleware::from_fn(auth_layer));

    let admin = Router::new()
        .route("/admin/stats", get(admin_stats))
        .route("/admin/clusters", get(admin_clusters))
        .route("/admin/policies", get(admin_policies));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .merge(api)
        .merge(admin);

    if state.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        .layer(middleware::from_fn(cors_layer))
        .layer(middleware::from_fn(trace_layer))
        .layer(middleware::from_fn(recovery_layer))
}

/// Service label for a proxied request: first path segment behind `/api`.
fn request_service(path: &str) -> &str {
    util::service_name(path.strip_prefix("/api").unwrap_or(path))
}

// ---------------------------------------------------------------------------
// middleware chain, outermost first

/// Panics anywhere below become a 500 instead of tearing the worker down.
async fn recovery_layer(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            error!("request handler panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}

async fn trace_layer(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = info_span!("request", method = %method, path = %path);

    async move {
        let start = Instant::now();
        let response = next.run(req).await;
        debug!(
            status = response.status().as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "request completed"
        );
        response
    }
    .instrument(span)
    .await
}

async fn cors_layer(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(&mut response);
        return response;
    }

    let mut response = next.run(req).await;
    apply_cors(&mut response);
    response
}

fn apply_cors(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static(
            "Origin, Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization",
        ),
    );
}

/// Authentication is an external collaborator; requests currently pass
/// through unchanged.
async fn auth_layer(req: Request, next: Next) -> Response {
    next.run(req).await
}

/// Admission step one: correlate the route with a cluster, stash the tag
/// for the rest of the pipeline, and consult the limiter.
async fn rate_limit_layer(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let service = request_service(&path).to_string();
    let route_key = signature::route_signature(&service, &method, &path);
    let cluster_id = state
        .vector_agent
        .correlate_route(&route_key)
        .unwrap_or_default();

    req.extensions_mut().insert(ClusterTag {
        cluster_id: cluster_id.clone(),
        route_key,
        service,
    });

    if !state.limiter.allow(&cluster_id) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Rate limit exceeded",
                "code": "RATE_LIMIT_EXCEEDED",
            })),
        )
            .into_response();
    }

    next.run(req).await
}

/// Admission step two plus outcome recording. Success/failure is charged
/// to the admission-time cluster id from the request tag.
async fn breaker_layer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let tag = req
        .extensions()
        .get::<ClusterTag>()
        .cloned()
        .unwrap_or_else(|| ClusterTag {
            cluster_id: String::new(),
            route_key: String::new(),
            service: String::new(),
        });

    if !state.breaker.allow(&tag.cluster_id) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Service temporarily unavailable",
                "code": "CIRCUIT_BREAKER_OPEN",
            })),
        )
            .into_response();
    }

    let response = next.run(req).await;

    if response.status().as_u16() >= 500 {
        state.breaker.record_failure(&tag.cluster_id);
    } else {
        state.breaker.record_success(&tag.cluster_id);
    }

    response
}

/// Response observation: on failure, hand the sampler a capture candidate
/// and classify the error signature off the hot path so the next request
/// on this route is admitted under the right cluster.
async fn sampling_layer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let tag = req.extensions().get::<ClusterTag>().cloned();

    let response = next.run(req).await;
    let status = response.status();
    if status.as_u16() < 400 {
        return response;
    }

    let (message, frames) = match response.extensions().get::<ErrorDetail>() {
        Some(detail) => (detail.message.clone(), detail.frames.clone()),
        None => (
            status.canonical_reason().unwrap_or("error").to_string(),
            Vec::new(),
        ),
    };

    let (service, route_key) = match &tag {
        Some(tag) => (tag.service.clone(), tag.route_key.clone()),
        None => {
            let service = request_service(&path).to_string();
            let route_key = signature::route_signature(&service, &method, &path);
            (service, route_key)
        }
    };

    state.sampler.sample(SampledFailure {
        trace_id: None,
        span_id: None,
        method: method.clone(),
        path: path.clone(),
        service_name: service.clone(),
        status_code: status.as_u16(),
        error_message: message.clone(),
        stack_trace: frames.clone(),
    });

    let agent = state.vector_agent.clone();
    tokio::spawn(async move {
        let sig = signature::build_raw_signature(&service, &method, &path, &message, &frames);
        agent.classify_failure(&route_key, &sig).await;
    });

    response
}

/// Innermost: only requests that cleared admission are recorded, and the
/// duration covers the proxied call alone.
async fn metrics_layer(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let start = Instant::now();
    let response = next.run(req).await;

    metrics::REQUESTS_TOTAL
        .with_label_values(&[&method, response.status().as_str()])
        .inc();
    metrics::REQUEST_DURATION
        .with_label_values(&[&method])
        .observe(start.elapsed().as_secs_f64());
    response
}

// ---------------------------------------------------------------------------
// handlers

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    // every component is wired before the router is built, so readiness
    // is a per-component presence map plus a little visibility
    let components = json!({
        "rate_limiter": true,
        "circuit_breaker": true,
        "vector_agent": true,
        "policy_watcher": true,
    });

    let ready = components
        .as_object()
        .is_some_and(|map| map.values().all(|v| v.as_bool().unwrap_or(false)));

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "components": components,
            "clusters": state.vector_agent.cluster_count(),
            "policies": state.watcher.policy_count(),
            "timestamp": chrono::Utc::now().timestamp(),
        })),
    )
}

#[derive(Deserialize)]
struct ProxyQuery {
    #[serde(default)]
    simulate_error: Option<String>,
}

async fn proxy_handler(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    req: Request,
) -> Response {
    let path = req.uri().path().to_string();
    let service = request_service(&path).to_string();

    if query.simulate_error.as_deref() == Some("true") {
        let mut response = (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Simulated error for testing",
                "service": service,
                "path": path,
            })),
        )
            .into_response();
        response.extensions_mut().insert(ErrorDetail {
            message: "Simulated error for testing".into(),
            frames: Vec::new(),
        });
        return response;
    }

    match &state.upstream {
        Some((client, base)) => forward(client, base, req).await,
        None => Json(json!({
            "message": "Request processed successfully",
            "service": service,
            "path": path,
            "method": req.method().as_str(),
            "timestamp": chrono::Utc::now().timestamp(),
        }))
        .into_response(),
    }
}

/// Forward to the configured downstream. Timeouts and transport errors
/// surface as 502 and are classified as failures upstream in the chain.
async fn forward(client: &reqwest::Client, base: &url::Url, req: Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let target = match base.join(&path_and_query) {
        Ok(target) => target,
        Err(err) => {
            return bad_gateway(format!("invalid upstream path: {err}"));
        }
    };

    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return bad_gateway("unsupported method".into()),
    };

    let body = match axum::body::to_bytes(req.into_body(), 2 * 1024 * 1024).await {
        Ok(body) => body,
        Err(err) => return bad_gateway(format!("failed to read request body: {err}")),
    };

    let upstream_response = client.request(method, target).body(body.to_vec()).send().await;

    match upstream_response {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            match response.bytes().await {
                Ok(bytes) => (status, [("content-type", content_type)], bytes.to_vec())
                    .into_response(),
                Err(err) => bad_gateway(format!("failed to read upstream body: {err}")),
            }
        }
        Err(err) => {
            // keep the outermost two links of the error chain as frames
            let mut frames = vec![err.to_string()];
            if let Some(source) = std::error::Error::source(&err) {
                frames.push(source.to_string());
            }
            let mut response = (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "upstream request failed",
                })),
            )
                .into_response();
            response.extensions_mut().insert(ErrorDetail {
                message: err.to_string(),
                frames,
            });
            response
        }
    }
}

fn bad_gateway(message: String) -> Response {
    let mut response = (
        StatusCode::BAD_GATEWAY,
        Json(json!({"error": message})),
    )
        .into_response();
    response.extensions_mut().insert(ErrorDetail {
        message,
        frames: Vec::new(),
    });
    response
}

#[derive(Deserialize)]
struct ClusterQuery {
    cluster_id: Option<String>,
}

async fn admin_stats(
    State(state): State<AppState>,
    Query(query): Query<ClusterQuery>,
) -> Response {
    let Some(cluster_id) = query.cluster_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "cluster_id parameter is required"})),
        )
            .into_response();
    };

    let limiter_stats = state.limiter.get_stats(&cluster_id);
    let breaker_snapshot = state.breaker.snapshot(&cluster_id);
    if limiter_stats.is_none() && breaker_snapshot.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No stats found for cluster: {cluster_id}")})),
        )
            .into_response();
    }

    Json(json!({
        "cluster_id": cluster_id,
        "limiter": limiter_stats,
        "breaker": breaker_snapshot,
        "breaker_state": state.breaker.state(&cluster_id),
    }))
    .into_response()
}

async fn admin_clusters(State(state): State<AppState>) -> Response {
    let clusters: Vec<serde_json::Value> = state
        .clustering
        .all_clusters()
        .into_iter()
        .map(|cluster| {
            json!({
                "id": cluster.id,
                "size": cluster.error_count,
                "severity": cluster.severity,
                "description": cluster.description,
                "update_time": cluster.update_time,
            })
        })
        .collect();

    Json(json!({
        "count": clusters.len(),
        "clusters": clusters,
    }))
    .into_response()
}

async fn admin_policies(
    State(state): State<AppState>,
    Query(query): Query<ClusterQuery>,
) -> Response {
    let Some(cluster_id) = query.cluster_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "cluster_id parameter is required"})),
        )
            .into_response();
    };

    match state.watcher.get_policy(&cluster_id) {
        Some(policy) => Json(policy).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No policy found for cluster: {cluster_id}")})),
        )
            .into_response(),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
