//! Local control API
//!
//! Thin HTTP surface over a [`SessionHandle`]: start, return to wake
//! listening, stop, and read the current status.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::session::{SessionHandle, SessionStatus};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Error body: `{ "error": { "code", "message" } }`
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, error: &crate::Error) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        }),
    )
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(session): State<SessionHandle>) -> Json<SessionStatus> {
    Json(session.status())
}

/// Run a command and answer with the status snapshot at the time of the request
fn command(
    session: &SessionHandle,
    name: &'static str,
    send: impl FnOnce(&SessionHandle) -> Result<()>,
) -> std::result::Result<(StatusCode, Json<SessionStatus>), ApiError> {
    tracing::info!(command = name, "control api command");
    send(session).map_err(|e| {
        tracing::warn!(command = name, error = %e, "control api command failed");
        error_response(StatusCode::SERVICE_UNAVAILABLE, &e)
    })?;
    Ok((StatusCode::ACCEPTED, Json(session.status())))
}

async fn start(
    State(session): State<SessionHandle>,
) -> std::result::Result<(StatusCode, Json<SessionStatus>), ApiError> {
    command(&session, "start", SessionHandle::start)
}

async fn wake(
    State(session): State<SessionHandle>,
) -> std::result::Result<(StatusCode, Json<SessionStatus>), ApiError> {
    command(&session, "return_to_wake", SessionHandle::return_to_wake)
}

async fn stop(
    State(session): State<SessionHandle>,
) -> std::result::Result<(StatusCode, Json<SessionStatus>), ApiError> {
    command(&session, "stop", SessionHandle::stop)
}

/// Build the control router
pub fn router(session: SessionHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/session", get(status))
        .route("/session/start", post(start))
        .route("/session/wake", post(wake))
        .route("/session/stop", post(stop))
        .with_state(session)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Control API server
pub struct ApiServer {
    session: SessionHandle,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub const fn new(session: SessionHandle, port: u16) -> Self {
        Self { session, port }
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind control API: {e}")))?;

        tracing::info!(port = self.port, "control API listening");

        axum::serve(listener, router(self.session))
            .await
            .map_err(|e| crate::Error::Config(format!("control API error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
