//! HTTP Status Server
//!
//! Every request, whatever its path or method, gets the node's current
//! status line as a plain-text body.

use std::sync::Arc;

use axum::{extract::State, Router};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::election::shutdown_requested;
use crate::error::Result;
use crate::state::RoleState;

/// HTTP status server
pub struct StatusServer {
    bind_address: String,
    state: Arc<RoleState>,
}

impl StatusServer {
    /// Create a new status server
    pub fn new(bind_address: impl Into<String>, state: Arc<RoleState>) -> Self {
        Self {
            bind_address: bind_address.into(),
            state,
        }
    }

    /// Create the router
    pub fn router(state: Arc<RoleState>) -> Router {
        Router::new()
            .fallback(handle_status)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the listening socket. Fails if the port is taken.
    pub async fn bind(&self) -> Result<tokio::net::TcpListener> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Status endpoint listening on {}", self.bind_address);
        Ok(listener)
    }

    /// Serve on `listener` until `shutdown` turns true
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let app = Self::router(Arc::clone(&self.state));
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
            .await?;

        tracing::info!("Status endpoint stopped");
        Ok(())
    }

    /// Bind and serve until `shutdown` turns true
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }
}

async fn handle_status(State(state): State<Arc<RoleState>>) -> String {
    state.status_line()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use crate::state::LeaderAddress;

    async fn body_of(state: &Arc<RoleState>, method: Method, uri: &str) -> String {
        let response = StatusServer::router(Arc::clone(state))
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_status_before_any_leader() {
        let state = Arc::new(RoleState::new());
        assert_eq!(
            body_of(&state, Method::GET, "/").await,
            "I am a follower and the leader is on port unknown"
        );
    }

    #[tokio::test]
    async fn test_status_on_any_path_and_method() {
        let state = Arc::new(RoleState::new());
        state.record_leader(LeaderAddress::Port(9001));

        for (method, uri) in [
            (Method::GET, "/"),
            (Method::GET, "/status"),
            (Method::POST, "/anything/at/all"),
            (Method::DELETE, "/leader?x=1"),
        ] {
            assert_eq!(
                body_of(&state, method, uri).await,
                "I am a follower and the leader is on port 9001"
            );
        }

        state.promote(LeaderAddress::Port(9002));
        assert_eq!(body_of(&state, Method::GET, "/").await, "I am the leader");
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let state = Arc::new(RoleState::new());
        state.promote(LeaderAddress::Port(9001));
        let server = StatusServer::new("127.0.0.1:0", Arc::clone(&state));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { server.serve(listener, rx).await });

        let body = reqwest::get(format!("http://{}/", addr)).await.unwrap().text().await.unwrap();
        assert_eq!(body, "I am the leader");

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let server = StatusServer::new(addr.to_string(), Arc::new(RoleState::new()));
        assert!(matches!(server.bind().await, Err(crate::Error::Io(_))));
    }
}
