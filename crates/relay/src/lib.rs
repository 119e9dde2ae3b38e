// tandem-relay library entry point: document sync, presence and the
// WebSocket broadcast router behind the `tandem-relay` binary.

pub mod api;
pub mod auth;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod presence;
pub mod services;
pub mod sync;
pub mod ws;

use std::time::Instant;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info};

use crate::error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope};
use crate::services::RelayServices;

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check, WebSocket endpoint and admin API behind the shared middleware.
pub fn build_router(services: &RelayServices) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(services.broadcast.clone()))
            .merge(api::router(services.api_state(), services.verifier.clone())),
    )
    .layer(cors::cors_layer(services.config.cors_origins.as_deref()))
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
