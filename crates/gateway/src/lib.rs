//! HTTP gateway for turnkeep.
//!
//! Turns are accepted over REST, run as detached background jobs and
//! reported over SSE. Built on Axum.

pub mod api_v1;
pub mod error;
pub mod jobs;

pub use error::GatewayError;
pub use jobs::{JobManager, JobRecord, JobStatus};

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use turnkeep_engine::TurnEngine;

/// Build the full router: health check plus the v1 API.
///
/// Layers: request body limit (1 MB), CORS for configured origins and
/// HTTP trace logging.
pub fn build_router(state: api_v1::SharedApiState) -> Router {
    let cors = cors_layer(&state.jobs.engine().config().gateway.cors_origins);
    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// `*` allows any origin. Unparseable origins are skipped with a warning.
/// With no origins, preflights get no allow-origin header.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|origin| {
            match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(%origin, "Ignoring invalid CORS origin");
                    None
                }
            }
        }))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(api_v1::USER_HEADER),
        ])
        .max_age(Duration::from_secs(3600))
}

fn is_loopback(host: &str) -> bool {
    host == "localhost" || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Start the gateway HTTP server.
pub async fn start(engine: Arc<TurnEngine>) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = engine.config().gateway.clone();
    let addr = format!("{}:{}", gateway.host, gateway.port);
    if !gateway.allow_public_bind && !is_loopback(&gateway.host) {
        return Err(GatewayError::PublicBind(addr).into());
    }

    let state = Arc::new(api_v1::ApiV1State::new(engine));
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint() {
        let state = Arc::new(api_v1::ApiV1State::new(test_support::engine(
            test_support::TestProvider::new(),
        )));
        let app = build_router(state);

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_allows_configured_origins_only() {
        let mut config = turnkeep_config::AppConfig::default();
        config.gateway.cors_origins = vec!["http://kitchen.local".into(), "not an origin\n".into()];
        let engine = test_support::engine_with(config, test_support::TestProvider::new());
        let app = build_router(Arc::new(api_v1::ApiV1State::new(engine)));

        let preflight = |origin: &str| {
            Request::builder()
                .method("OPTIONS")
                .uri("/v1/sessions")
                .header("origin", origin)
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(preflight("http://kitchen.local")).await.unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://kitchen.local"
        );

        let response = app.oneshot(preflight("http://elsewhere.example")).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[test]
    fn only_loopback_hosts_bind_by_default() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("localhost"));
        assert!(is_loopback("::1"));
        assert!(!is_loopback("0.0.0.0"));
    }
}
