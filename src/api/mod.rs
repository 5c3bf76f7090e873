// HTTP API module
// REST surface of the runtime: runs, debug sessions, versions and read endpoints

//! # API Module
//!
//! An axum router over [`PipelineRunner`]. Every request gets an
//! `X-Request-Id` (the caller's, or a fresh UUID) that is echoed in the
//! response, recorded on the handler span and propagated to outbound calls.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST | `/run/:pipeline_id` | run the approved version (`?with_stop=true` waits) |
//! | POST | `/run/version/:version_id` | run a specific version |
//! | POST | `/debug/` | create a debug task |
//! | POST | `/debug/run` | step over / resume a debug task |
//! | GET | `/pipelines/:id`, `/versions/:id`, `/tasks/:id` | reads |
//! | GET | `/health`, `/modules` | operational and editor endpoints |

pub mod handlers;
pub mod types;


use axum::{
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::engine::runner::PipelineRunner;
use crate::integrations::http::REQUEST_ID_HEADER;
use crate::{PipelinerError, Result};

/// Login of the acting user
pub const USER_HEADER: &str = "X-User";

/// Request id attached by the middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Shared application state for the handlers
#[derive(Clone)]
pub struct AppState {
    pub runner: PipelineRunner,
    /// Mode of run requests without `with_stop`
    pub async_run_default: bool,
}

impl AppState {
    pub fn new(runner: PipelineRunner) -> Self {
        Self {
            runner,
            async_run_default: true,
        }
    }

    pub fn with_async_run_default(mut self, async_default: bool) -> Self {
        self.async_run_default = async_default;
        self
    }
}

async fn request_id<B>(mut req: Request<B>, next: Next<B>) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Create the router with every route, the request-id middleware and tracing
pub fn create_router(state: AppState, cors: bool) -> Router {
    let router = Router::new()
        // Runs
        .route("/run/:pipeline_id", post(handlers::run_pipeline))
        .route("/run/version/:version_id", post(handlers::run_version))
        // Debug
        .route("/debug/", post(handlers::create_debug_task))
        .route("/debug/run", post(handlers::debug_run))
        // Pipelines and versions
        .route("/pipelines", post(handlers::create_pipeline))
        .route(
            "/pipelines/:id",
            get(handlers::get_pipeline).delete(handlers::delete_pipeline),
        )
        .route(
            "/pipelines/:id/versions",
            get(handlers::list_versions).post(handlers::create_version),
        )
        .route("/pipelines/:id/rollback/:version_id", post(handlers::rollback))
        .route("/pipelines/:id/tags", get(handlers::get_tags))
        .route(
            "/pipelines/:id/tags/:tag",
            put(handlers::attach_tag).delete(handlers::detach_tag),
        )
        .route("/pipelines/:id/scheduler-tasks", get(handlers::scheduler_tasks))
        .route("/versions", put(handlers::update_draft))
        .route(
            "/versions/:id",
            get(handlers::get_version).delete(handlers::delete_version),
        )
        .route("/versions/:id/send-to-approve", post(handlers::send_to_approve))
        .route("/versions/:id/approve", post(handlers::approve))
        .route("/versions/:id/reject", post(handlers::reject))
        // Tasks
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/:id", get(handlers::get_task))
        .route("/tasks/:id/cancel", post(handlers::cancel_task))
        // Operational
        .route("/health", get(handlers::health))
        .route("/modules", get(handlers::modules))
        .route("/modules/:name/usage", get(handlers::module_usage))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id));

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// HTTP server wrapping the router
pub struct ApiServer {
    host: String,
    port: u16,
    cors: bool,
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            cors: true,
            state,
        }
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.cors = enabled;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Run the server until the process is stopped
    pub async fn run(self) -> Result<()> {
        let addr = self.address();
        let socket = addr
            .parse()
            .map_err(|e| PipelinerError::Config(format!("invalid bind address {}: {}", addr, e)))?;
        let app = create_router(self.state, self.cors);

        info!("🚀 Pipeliner API listening on http://{}", addr);
        info!("🔗 Endpoints:");
        info!("   POST http://{}/run/:pipeline_id", addr);
        info!("   POST http://{}/run/version/:version_id", addr);
        info!("   POST http://{}/debug/run", addr);
        info!("   GET  http://{}/health", addr);
        info!("   CORS enabled: {}", self.cors);

        axum::Server::bind(&socket)
            .serve(app.into_make_service())
            .await
            .map_err(|e| PipelinerError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pipeline::EngineLimits;
    use crate::engine::storage::InMemoryStorage;
    use crate::engine::test_support::create_test_loader;
    use crate::integrations::Services;
    use axum::body::Body;
    use axum::http::{Method, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_app() -> Router {
        let runner = PipelineRunner::new(
            Arc::new(InMemoryStorage::new()),
            create_test_loader(),
            Services::default(),
            EngineLimits::default(),
        );
        create_router(AppState::new(runner), true)
    }

    #[tokio::test]
    async fn test_request_id_is_echoed_or_generated() {
        let response = create_test_app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");

        let response = create_test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let generated = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(generated).is_ok());
    }

    #[tokio::test]
    async fn test_teapot_endpoint() {
        let response = create_test_app()
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri(format!("/pipelines/{}/scheduler-tasks", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn test_bad_uuid_uses_envelope() {
        let response = create_test_app()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/run/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: types::ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.status_code, 500);
        assert!(body.error.starts_with("can't parse uuid"));
    }
}
