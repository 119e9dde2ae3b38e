// CORS configuration for the admin routes and the WebSocket upgrade.
//
// Origins come from `RelayConfig::cors_origins` (comma-separated, or `*`).
// Without a value only local development origins are allowed.

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(std::time::Duration::from_secs(3600));

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()),
        Some(list) if !list.is_empty() => base.allow_origin(parse_origins(list)).allow_credentials(true),
        _ => base
            .allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(",")))
            .allow_credentials(true),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, response::Response, routing::get, Router};
    use tower::ServiceExt;

    async fn preflight(origins: Option<&str>, origin: &str) -> Response {
        Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .layer(cors_layer(origins))
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/healthz")
                    .header("origin", origin)
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("preflight should return a response")
    }

    #[tokio::test]
    async fn default_allows_local_dev_origin() {
        let response = preflight(None, "http://localhost:5173").await;
        assert_eq!(
            response.headers().get("access-control-allow-origin").map(|v| v.as_bytes()),
            Some("http://localhost:5173".as_bytes())
        );
    }

    #[tokio::test]
    async fn default_rejects_unknown_origin() {
        let response = preflight(None, "https://evil.example.com").await;
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_list_replaces_defaults() {
        let origins = Some("https://app.tandem.dev, https://staging.tandem.dev");
        let allowed = preflight(origins, "https://staging.tandem.dev").await;
        assert!(allowed.headers().get("access-control-allow-origin").is_some());

        let local = preflight(origins, "http://localhost:3000").await;
        assert!(local.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin_without_credentials() {
        let response = preflight(Some("*"), "https://anything.example.com").await;
        assert_eq!(
            response.headers().get("access-control-allow-origin").map(|v| v.as_bytes()),
            Some("*".as_bytes())
        );
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }
}
