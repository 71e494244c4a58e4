// Gateway end-to-end tests
// Drives the assembled router through the full middleware chain with the
// in-memory collaborators and the deterministic embedder
//
// Numan Thabit 2025 Nov

use aware_gateway::breaker::ClusterCircuitBreaker;
use aware_gateway::clustering::ClusteringEngine;
use aware_gateway::config::AppConfig;
use aware_gateway::controlplane::ControlPlane;
use aware_gateway::embedding::{EmbeddingService, HashEmbedder};
use aware_gateway::gateway::Gateway;
use aware_gateway::limiter::ClusterRateLimiter;
use aware_gateway::policy::PolicyEngine;
use aware_gateway::sampler::ErrorSampler;
use aware_gateway::server::{create_router, AppState};
use aware_gateway::signature;
use aware_gateway::store::{MemoryBus, MemoryConfigStore, MemoryVectorStore};
use aware_gateway::types::{CircuitBreakPolicy, Policy, PolicyType, RateLimitPolicy};
use aware_gateway::vector_agent::VectorAgent;
use aware_gateway::watcher::PolicyWatcher;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Harness {
    router: Router,
    state: AppState,
    embedding: Arc<EmbeddingService>,
}

fn harness(mutate: impl FnOnce(&mut AppConfig)) -> Harness {
    let mut config = AppConfig::default();
    mutate(&mut config);

    let embedding = Arc::new(EmbeddingService::new(
        &config.embedding,
        Arc::new(HashEmbedder::new(config.embedding.dimension)),
    ));
    let clustering = Arc::new(ClusteringEngine::new(
        config.clustering.clone(),
        embedding.clone(),
        Arc::new(MemoryVectorStore::new()),
    ));
    let (sampler, _queue) = ErrorSampler::new(&config.sampler);

    let state = AppState {
        limiter: Arc::new(ClusterRateLimiter::new(config.limiter.clone())),
        breaker: Arc::new(ClusterCircuitBreaker::new(config.breaker.clone())),
        sampler: Arc::new(sampler),
        vector_agent: Arc::new(VectorAgent::new(
            embedding.clone(),
            config.clustering.similarity_threshold,
        )),
        watcher: Arc::new(PolicyWatcher::new(Arc::new(MemoryConfigStore::new()))),
        clustering,
        upstream: None,
        metrics_enabled: true,
    };

    Harness {
        router: create_router(state.clone()),
        state,
        embedding,
    }
}

async fn request(router: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    request(router, "GET", uri).await
}

async fn metrics_text(router: &Router) -> String {
    let response = router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_check_reports_healthy() {
    let h = harness(|_| {});
    let (status, body) = get(&h.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_i64());
}

#[tokio::test]
async fn ready_reports_component_map() {
    let h = harness(|_| {});
    let (status, body) = get(&h.router, "/ready").await;
    assert!(status == StatusCode::OK || status == StatusCode::SERVICE_UNAVAILABLE);
    assert!(!body["status"].as_str().unwrap().is_empty());
    assert_eq!(body["components"]["rate_limiter"], true);
    assert_eq!(body["components"]["circuit_breaker"], true);
}

#[tokio::test]
async fn api_requests_are_proxied() {
    let h = harness(|_| {});
    let (status, body) = get(&h.router, "/api/test").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Request processed successfully");
    assert_eq!(body["service"], "test");
    assert_eq!(body["path"], "/api/test");
}

#[tokio::test]
async fn simulated_errors_return_500() {
    let h = harness(|_| {});
    let (status, body) = get(&h.router, "/api/test?simulate_error=true").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Simulated error for testing");
    assert_eq!(body["service"], "test");
}

#[tokio::test]
async fn cors_preflight_returns_204_with_headers() {
    let h = harness(|_| {});
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()["Access-Control-Allow-Origin"],
        "*"
    );
}

#[tokio::test]
async fn unthrottled_traffic_passes_at_default_rate() {
    // default_rate 1000/s, 100 rapid requests with an unknown cluster:
    // all of them are admitted
    let h = harness(|_| {});
    for _ in 0..100 {
        let (status, _) = get(&h.router, "/api/test").await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn default_bucket_exhaustion_returns_429() {
    let h = harness(|config| {
        config.limiter.default_rate = 2.0; // capacity 2, 2 tokens/s
    });

    let (first, _) = get(&h.router, "/api/test").await;
    let (second, _) = get(&h.router, "/api/test").await;
    let (third, body) = get(&h.router, "/api/test").await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(third, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
}

/// Establish route -> cluster correlation the way production does: one
/// failing request whose signature matches a known centroid.
async fn correlate_route(h: &Harness, cluster_id: &str) {
    let sig = signature::build_raw_signature(
        "test",
        "GET",
        "/api/test",
        "Simulated error for testing",
        &[],
    );
    let centroid = h.embedding.embed(&sig).await.unwrap();
    h.state
        .vector_agent
        .update_clusters(HashMap::from([(cluster_id.to_string(), centroid)]));

    let (status, _) = get(&h.router, "/api/test?simulate_error=true").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let route_key = signature::route_signature("test", "GET", "/api/test");
    for _ in 0..100 {
        if h.state.vector_agent.correlate_route(&route_key).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("route was never correlated with {cluster_id}");
}

#[tokio::test]
async fn cluster_rate_policy_throttles_only_that_cluster() {
    let h = harness(|config| {
        config.limiter.max_rate = 5.0;
    });
    correlate_route(&h, "cluster_k").await;

    let policy = Policy {
        policy_id: "policy_k".into(),
        cluster_id: "cluster_k".into(),
        policy_type: PolicyType::RateLimit,
        severity: 0.5,
        rate_limit: Some(RateLimitPolicy {
            limit_rate: 0.5,
            duration_secs: 300,
        }),
        circuit_break: None,
        create_time: Utc::now(),
        expire_time: Utc::now() + chrono::Duration::seconds(300),
        is_active: true,
    };
    h.state.limiter.update_policy("cluster_k", &policy);

    // the tagged route burns its 5-token bucket, then is throttled
    let mut denied = 0;
    for _ in 0..10 {
        let (status, _) = get(&h.router, "/api/test").await;
        if status == StatusCode::TOO_MANY_REQUESTS {
            denied += 1;
        }
    }
    assert!(denied >= 4, "expected throttling on the tagged route, denied={denied}");

    // a different route is untagged and sails through the default bucket
    let (status, _) = get(&h.router, "/api/other").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn open_breaker_returns_503_for_correlated_route() {
    let h = harness(|_| {});
    correlate_route(&h, "cluster_k").await;

    let policy = Policy {
        policy_id: "policy_k".into(),
        cluster_id: "cluster_k".into(),
        policy_type: PolicyType::CircuitBreak,
        severity: 0.9,
        rate_limit: None,
        circuit_break: Some(CircuitBreakPolicy {
            break_duration_secs: 30,
            recovery_step: 1.0,
        }),
        create_time: Utc::now(),
        expire_time: Utc::now() + chrono::Duration::seconds(300),
        is_active: true,
    };
    h.state.breaker.update_policy("cluster_k", &policy);

    let (status, body) = get(&h.router, "/api/test").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "CIRCUIT_BREAKER_OPEN");

    // other routes carry no cluster tag and bypass the breaker
    let (status, _) = get(&h.router, "/api/other").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn consecutive_failures_trip_the_breaker() {
    let h = harness(|config| {
        config.breaker.failure_threshold = 3;
        config.breaker.recovery_timeout = Duration::from_millis(200);
        config.breaker.recovery_increment = 1.0;
    });
    correlate_route(&h, "cluster_k").await;

    // a zero-severity policy installs the breaker cell without opening it
    let policy = Policy {
        policy_id: "policy_k".into(),
        cluster_id: "cluster_k".into(),
        policy_type: PolicyType::CircuitBreak,
        severity: 0.0,
        rate_limit: None,
        circuit_break: Some(CircuitBreakPolicy {
            break_duration_secs: 1,
            recovery_step: 1.0,
        }),
        create_time: Utc::now(),
        expire_time: Utc::now() + chrono::Duration::seconds(300),
        is_active: true,
    };
    h.state.breaker.update_policy("cluster_k", &policy);

    // three consecutive 500s on the correlated route
    for _ in 0..3 {
        let (status, _) = get(&h.router, "/api/test?simulate_error=true").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // the fourth request is refused outright
    let (status, body) = get(&h.router, "/api/test").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "CIRCUIT_BREAKER_OPEN");

    // after the break duration the breaker admits a probe again
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let (status, _) = get(&h.router, "/api/test").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn admin_stats_requires_cluster_id() {
    let h = harness(|_| {});
    let (status, body) = get(&h.router, "/admin/stats").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cluster_id"));

    let (status, _) = get(&h.router, "/admin/stats?cluster_id=cluster_ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_stats_reports_known_cluster() {
    let h = harness(|_| {});
    let policy = Policy {
        policy_id: "policy_k".into(),
        cluster_id: "cluster_k".into(),
        policy_type: PolicyType::RateLimit,
        severity: 0.4,
        rate_limit: Some(RateLimitPolicy {
            limit_rate: 0.5,
            duration_secs: 300,
        }),
        circuit_break: None,
        create_time: Utc::now(),
        expire_time: Utc::now() + chrono::Duration::seconds(300),
        is_active: true,
    };
    h.state.limiter.update_policy("cluster_k", &policy);

    let (status, body) = get(&h.router, "/admin/stats?cluster_id=cluster_k").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cluster_id"], "cluster_k");
    assert_eq!(body["limiter"]["rate"], 5000.0);
    assert_eq!(body["breaker_state"], "Closed");
}

#[tokio::test]
async fn admin_policies_looks_up_the_watcher() {
    let h = harness(|_| {});
    let (status, _) = get(&h.router, "/admin/policies").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&h.router, "/admin/policies?cluster_id=cluster_none").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_clusters_lists_the_cluster_table() {
    let h = harness(|_| {});
    let (status, body) = get(&h.router, "/admin/clusters").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert!(body["clusters"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let h = harness(|_| {});
    get(&h.router, "/api/test").await;

    let text = metrics_text(&h.router).await;
    assert!(text.contains("gateway_requests_total"));
}

// These two tests use methods no other test sends, because the
// prometheus registry is shared across the whole test binary.

#[tokio::test]
async fn rate_limited_requests_are_not_metered() {
    let h = harness(|config| {
        config.limiter.default_rate = 1.0; // capacity 1
    });

    let (first, _) = request(&h.router, "DELETE", "/api/test").await;
    assert_eq!(first, StatusCode::OK);
    let (second, body) = request(&h.router, "DELETE", "/api/test").await;
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");

    // the admitted request is recorded; the 429 short-circuit never
    // reaches the metrics layer
    let text = metrics_text(&h.router).await;
    assert!(text.contains(r#"method="DELETE",status="200""#));
    assert!(!text.contains(r#"method="DELETE",status="429""#));
}

#[tokio::test]
async fn breaker_denied_requests_are_not_metered() {
    let h = harness(|_| {});

    // correlate the route directly, without driving failing traffic
    let sig = signature::build_raw_signature("test", "PUT", "/api/test", "boom", &[]);
    let centroid = h.embedding.embed(&sig).await.unwrap();
    h.state
        .vector_agent
        .update_clusters(HashMap::from([("cluster_k".to_string(), centroid)]));
    let route_key = signature::route_signature("test", "PUT", "/api/test");
    assert_eq!(
        h.state.vector_agent.classify_failure(&route_key, &sig).await,
        "cluster_k"
    );

    let policy = Policy {
        policy_id: "policy_k".into(),
        cluster_id: "cluster_k".into(),
        policy_type: PolicyType::CircuitBreak,
        severity: 0.9,
        rate_limit: None,
        circuit_break: Some(CircuitBreakPolicy {
            break_duration_secs: 30,
            recovery_step: 1.0,
        }),
        create_time: Utc::now(),
        expire_time: Utc::now() + chrono::Duration::seconds(300),
        is_active: true,
    };
    h.state.breaker.update_policy("cluster_k", &policy);

    let (status, body) = request(&h.router, "PUT", "/api/test").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "CIRCUIT_BREAKER_OPEN");

    // an uncorrelated route with the same method sails through and is
    // the only PUT the registry ever sees
    let (status, _) = request(&h.router, "PUT", "/api/other").await;
    assert_eq!(status, StatusCode::OK);

    let text = metrics_text(&h.router).await;
    assert!(text.contains(r#"method="PUT",status="200""#));
    assert!(!text.contains(r#"method="PUT",status="503""#));
}

/// Closed loop: failing traffic -> sampler -> bus -> clustering -> policy
/// engine -> kv store -> watcher -> admission components.
#[tokio::test]
async fn feedback_loop_produces_and_applies_a_policy() {
    let mut config = AppConfig::default();
    config.sampler.sampling_rate = 1.0;
    config.policy.evaluation_interval = Duration::from_secs(1);
    config.policy.error_rate_threshold = 0.5;
    config.clustering.min_cluster_size = 1000; // keep re-fit out of the way

    let bus = Arc::new(MemoryBus::new());
    let kv = Arc::new(MemoryConfigStore::new());
    let embedding = Arc::new(EmbeddingService::new(
        &config.embedding,
        Arc::new(HashEmbedder::new(config.embedding.dimension)),
    ));
    let clustering = Arc::new(ClusteringEngine::new(
        config.clustering.clone(),
        embedding.clone(),
        Arc::new(MemoryVectorStore::new()),
    ));
    let policy_engine = Arc::new(PolicyEngine::new(
        config.policy.clone(),
        config.breaker.clone(),
        clustering.clone(),
        kv.clone(),
    ));
    let control_plane = Arc::new(ControlPlane::new(
        &config,
        clustering.clone(),
        policy_engine,
        bus.clone(),
    ));
    control_plane.start();

    let gateway = Gateway::new(&config, embedding.clone(), bus, kv);
    gateway
        .start(control_plane.subscribe_snapshots())
        .await
        .unwrap();

    let state = AppState {
        limiter: gateway.limiter.clone(),
        breaker: gateway.breaker.clone(),
        sampler: gateway.sampler.clone(),
        vector_agent: gateway.vector_agent.clone(),
        watcher: gateway.watcher.clone(),
        clustering: clustering.clone(),
        upstream: None,
        metrics_enabled: false,
    };
    let router = create_router(state);

    // a burst of one error family
    for _ in 0..20 {
        let (status, _) = get(&router, "/api/payment?simulate_error=true").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // clustering happens asynchronously behind the bus
    let mut clustered = false;
    for _ in 0..100 {
        if clustering.cluster_count() >= 1 {
            clustered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(clustered, "errors never reached the clustering engine");
    let cluster_id = clustering.all_clusters()[0].id.clone();

    // the policy engine's next tick writes a policy; the watcher picks it
    // up and hands it to the admission components
    let mut policy = None;
    for _ in 0..100 {
        if let Some(found) = gateway.watcher.get_policy(&cluster_id) {
            policy = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let policy = policy.expect("policy never reached the watcher");
    assert!(policy.severity >= 0.5);

    // the admin surface agrees
    let (status, body) = get(&router, &format!("/admin/policies?cluster_id={cluster_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cluster_id"], cluster_id);

    gateway.stop();
    control_plane.stop();
}
