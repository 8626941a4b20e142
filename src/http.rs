//! Read-only status HTTP server (§4.12, §6 scenario 8): `GET /health`,
//! `GET /peers`, `GET /shares`. Any other path 404s and any non-GET
//! method on a known path 405s — both are axum's default behavior for a
//! `Router` whose routes only register `get`, so no explicit fallback is
//! required.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum::http::StatusCode;
use serde::Serialize;

use crate::context::AppContext;
use crate::status;

#[derive(Serialize)]
struct PeersResponse {
    peers: Vec<status::PeerSummary>,
}

#[derive(Serialize)]
struct SharesResponse {
    shares: Vec<status::ShareSummary>,
}

/// axum's default 404/405 responses carry an empty body; the status
/// contract (§6) requires both to be JSON, so rewrite them here rather
/// than hand-register a fallback per route.
async fn json_error_body(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    match response.status() {
        StatusCode::NOT_FOUND => {
            (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "not found"}))).into_response()
        }
        StatusCode::METHOD_NOT_ALLOWED => (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(serde_json::json!({"error": "method not allowed"})),
        )
            .into_response(),
        _ => response,
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/peers", get(peers))
        .route("/shares", get(shares))
        .with_state(ctx)
        .layer(middleware::from_fn(json_error_body))
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<status::HealthStatus> {
    Json(status::health(ctx.node_id()))
}

async fn peers(State(ctx): State<Arc<AppContext>>) -> Json<PeersResponse> {
    Json(PeersResponse {
        peers: ctx.peer_snapshots().await,
    })
}

async fn shares(State(ctx): State<Arc<AppContext>>) -> Json<SharesResponse> {
    Json(SharesResponse {
        shares: status::share_summaries(&ctx.config.shares),
    })
}

pub async fn serve(ctx: Arc<AppContext>, host: &str, port: u16) -> std::io::Result<()> {
    let app = router(ctx);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "status http server listening");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    fn test_ctx() -> Arc<AppContext> {
        let yaml = r#"
node:
  id: node-a
  listen_port: 51888
security:
  ca_cert: ca.pem
  cert: node.pem
  key: node.key
shares:
  - name: docs
    path: ./docs
"#;
        let cfg: crate::config::KeyMeshConfig = serde_yaml::from_str(yaml).unwrap();
        Arc::new(AppContext::new(Arc::new(cfg)))
    }

    #[tokio::test]
    async fn health_returns_ok_json() {
        let app = router(test_ctx());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let app = router(test_ctx());
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn post_to_known_path_is_405() {
        let app = router(test_ctx());
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn shares_lists_configured_shares() {
        let app = router(test_ctx());
        let response = app
            .oneshot(Request::builder().uri("/shares").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
