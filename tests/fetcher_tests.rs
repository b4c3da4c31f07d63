//! Integration tests for the HTTP fetcher against an in-process target.

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

use herakles_scrape_gateway::fetcher::{FetchError, GATEWAY_INSTANCE_HEADER, INSTANCE_HEADER};
use herakles_scrape_gateway::{AuthEnricher, ContentType, Fetcher, HttpFetcher, Instance};

const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Echoes the routing headers back as a sample.
async fn echo_headers(headers: HeaderMap) -> impl IntoResponse {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        format!(
            "seen{{instance=\"{}\",gateway=\"{}\"}} 1\n",
            value(INSTANCE_HEADER),
            value(GATEWAY_INSTANCE_HEADER)
        ),
    )
}

async fn openmetrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, OPENMETRICS)],
        "om_metric 1\n# EOF\n",
    )
}

async fn broken() -> impl IntoResponse {
    (StatusCode::SERVICE_UNAVAILABLE, "down")
}

async fn slow() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_millis(1000)).await;
    "late 1\n"
}

async fn protected(headers: HeaderMap) -> impl IntoResponse {
    // scraper:secret
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Basic c2NyYXBlcjpzZWNyZXQ=");
    if authorized {
        (StatusCode::OK, "secret_metric 1\n")
    } else {
        (StatusCode::UNAUTHORIZED, "")
    }
}

async fn spawn_target() -> SocketAddr {
    let app = Router::new()
        .route("/metrics", get(echo_headers))
        .route("/openmetrics", get(openmetrics))
        .route("/broken", get(broken))
        .route("/slow", get(slow))
        .route("/protected", get(protected));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn instance(addr: SocketAddr, path: &str, instance_id: &str) -> Instance {
    Instance {
        org_name: "acme".to_string(),
        space_name: "prod".to_string(),
        app_name: "shop".to_string(),
        app_id: "shop-guid".to_string(),
        path: path.to_string(),
        protocol: "http".to_string(),
        instance_id: instance_id.to_string(),
        access_url: format!("http://{addr}{path}"),
        auth: AuthEnricher::None,
    }
}

#[tokio::test]
async fn test_fetch_sends_routing_headers() {
    let addr = spawn_target().await;
    let fetcher = HttpFetcher::new("gateway-1").unwrap();

    let result = fetcher
        .fetch(&instance(addr, "/metrics", "shop-guid:3"), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(result.content_type, ContentType::Text004);
    assert_eq!(
        result.data,
        "seen{instance=\"shop-guid:3\",gateway=\"gateway-1\"} 1\n"
    );
}

#[tokio::test]
async fn test_fetch_detects_openmetrics() {
    let addr = spawn_target().await;
    let fetcher = HttpFetcher::new("gateway-1").unwrap();

    let result = fetcher
        .fetch(&instance(addr, "/openmetrics", "shop-guid:0"), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(result.content_type, ContentType::OpenMetrics100);
    assert_eq!(result.data, "om_metric 1\n# EOF\n");
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let addr = spawn_target().await;
    let fetcher = HttpFetcher::new("gateway-1").unwrap();

    let err = fetcher
        .fetch(&instance(addr, "/broken", "shop-guid:0"), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Status { status: 503, .. }));
}

#[tokio::test]
async fn test_slow_target_times_out() {
    let addr = spawn_target().await;
    let fetcher = HttpFetcher::new("gateway-1").unwrap();

    let err = fetcher
        .fetch(&instance(addr, "/slow", "shop-guid:0"), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Timeout { .. }));
}

#[tokio::test]
async fn test_unreachable_target_is_a_connect_error() {
    // Bind and drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = HttpFetcher::new("gateway-1").unwrap();
    let err = fetcher
        .fetch(&instance(addr, "/metrics", "shop-guid:0"), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Connect { .. }));
}

#[tokio::test]
async fn test_basic_auth_is_applied() {
    let addr = spawn_target().await;
    let fetcher = HttpFetcher::new("gateway-1").unwrap();

    let mut anonymous = instance(addr, "/protected", "shop-guid:0");
    let err = fetcher
        .fetch(&anonymous, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 401, .. }));

    anonymous.auth = AuthEnricher::Basic {
        username: "scraper".to_string(),
        password: "secret".to_string(),
    };
    let result = fetcher
        .fetch(&anonymous, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.data, "secret_metric 1\n");
}
