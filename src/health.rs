//! Liveness Responder.
//!
//! Answers the hosting platform's health probes with a bare 200. It has
//! no dependency on Redis or the provisioning API: the restart policy
//! should be driven by process health only, not by downstream outages.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::errors::AppResult;

/// Start the liveness endpoint on `0.0.0.0:{port}`.
pub async fn start_health_server(port: u16) -> AppResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler));

    let listener = TcpListener::bind(&addr).await?;
    log::info!("Health endpoint listening on http://{}/health", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// GET / and GET /health — simple health check.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_handler_answers_200() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
