use crate::state::ControllerState;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::sync::Arc;

pub async fn readiness_probe(State(state): State<Arc<ControllerState>>) -> impl IntoResponse {
    if state.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Last observed registry digest per image key.
pub async fn digest_status(State(state): State<Arc<ControllerState>>) -> impl IntoResponse {
    Json(state.tracker().snapshot())
}

pub fn create_app(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/status", get(digest_status))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve(state: Arc<ControllerState>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_app(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_readiness_follows_first_cycle() {
        let state = Arc::new(ControllerState::new());
        let base = serve(state.clone()).await;

        let live = reqwest::get(format!("{}/health/live", base)).await.unwrap();
        assert_eq!(live.status(), StatusCode::NO_CONTENT);

        let ready = reqwest::get(format!("{}/health/ready", base)).await.unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.mark_cycle_completed();
        let ready = reqwest::get(format!("{}/health/ready", base)).await.unwrap();
        assert_eq!(ready.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_status_lists_tracked_digests() {
        let state = Arc::new(ControllerState::new());
        state.tracker().set("/nginx:latest", "sha256:aaa");
        let base = serve(state).await;

        let body: serde_json::Value = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({ "/nginx:latest": "sha256:aaa" }));
    }
}
