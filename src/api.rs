//! HTTP surface for the extension UI.
//!
//! Handlers stay thin: every decision is made by the [`Manager`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::error::{RemoveError, StoreError};
use crate::manager::Manager;
use crate::types::{Endpoint, EndpointOptions, Intent, Protocol};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    /// Bound on the pass run for a freshly requested tunnel.
    pub converge_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tunnels", get(list_tunnels).post(create_tunnel))
        .route("/tunnels/{container}", delete(remove_tunnel))
        .route("/intents", get(list_intents))
        .route("/intents/{container}", get(get_intent).delete(cancel_intent))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelView {
    pub id: String,
    pub url: String,
    pub container_id: String,
    pub target_port: u16,
    pub protocol: Protocol,
}

impl From<Endpoint> for TunnelView {
    fn from(e: Endpoint) -> Self {
        Self {
            id: e.forwarder_id,
            url: e.url,
            container_id: e.container_id,
            target_port: e.target_port,
            protocol: e.protocol,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnel {
    pub container_id: String,
    pub target_port: u16,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub options: EndpointOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remove(#[from] RemoveError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Remove(RemoveError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Remove(RemoveError::Close { .. })
            | ApiError::Remove(RemoveError::Timeout(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Store(_) | ApiError::Remove(RemoveError::Store(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("HTTP error: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelView>> {
    let tunnels = state.manager.cache().list().await;
    Json(tunnels.into_iter().map(TunnelView::from).collect())
}

async fn create_tunnel(
    State(state): State<AppState>,
    Json(body): Json<CreateTunnel>,
) -> Result<(StatusCode, Json<CreateTunnelResponse>), ApiError> {
    let container_id = body.container_id.trim();
    if container_id.is_empty() {
        return Err(ApiError::BadRequest("containerId is required".into()));
    }
    if body.target_port == 0 {
        return Err(ApiError::BadRequest("targetPort must be non-zero".into()));
    }
    info!(
        "Creating tunnel for container {} port {}",
        container_id, body.target_port
    );

    let intent = Intent {
        protocol: body.protocol,
        options: body.options,
        ..Intent::new(container_id, body.target_port)
    };
    let outcome = state
        .manager
        .request_tunnel(intent, state.converge_timeout)
        .await?;

    let status = if outcome.endpoint.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(CreateTunnelResponse {
            tunnel: outcome.endpoint.map(TunnelView::from),
            pending: outcome.pending_reason,
        }),
    ))
}

async fn remove_tunnel(
    State(state): State<AppState>,
    Path(container): Path<String>,
) -> Result<Json<BTreeMap<String, Endpoint>>, ApiError> {
    info!("Removing tunnel for container {}", container);
    let remaining = state.manager.remove_tunnel(&container).await?;
    Ok(Json(remaining.into_iter().collect()))
}

async fn list_intents(State(state): State<AppState>) -> Result<Json<Vec<Intent>>, ApiError> {
    Ok(Json(state.manager.intents().await?))
}

async fn get_intent(
    State(state): State<AppState>,
    Path(container): Path<String>,
) -> Result<Json<Intent>, ApiError> {
    match state.manager.intent(&container).await? {
        Some(intent) => Ok(Json(intent)),
        None => Err(RemoveError::NotFound(container).into()),
    }
}

async fn cancel_intent(
    State(state): State<AppState>,
    Path(container): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!("Cancelling intent for container {}", container);
    match state.manager.cancel_intent(&container).await? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(RemoveError::NotFound(container).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detect;
    use crate::error::{RuntimeError, TunnelError};
    use crate::manager::ManagerSettings;
    use crate::runtime::ContainerRuntime;
    use crate::session::SessionCache;
    use crate::store::FileStore;
    use crate::tunnel::{OpenRequest, TunnelService};
    use crate::types::{ContainerEvent, ContainerSnapshot, Forwarder};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct OneContainer;

    #[async_trait]
    impl ContainerRuntime for OneContainer {
        async fn list_running(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
            Ok(vec![ContainerSnapshot {
                id: "abc".into(),
                name: "web".into(),
                published_ports: Vec::new(),
                labels: HashMap::new(),
            }])
        }

        async fn monitor(&self, _event_tx: mpsc::Sender<ContainerEvent>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Tunnels(Mutex<Vec<Forwarder>>);

    #[async_trait]
    impl TunnelService for Tunnels {
        async fn open(&self, request: &OpenRequest) -> Result<Forwarder, TunnelError> {
            let forwarder = Forwarder {
                id: format!("fwd-{}", request.container_id),
                url: format!("https://{}.example.app", request.container_id),
                target: request.target.clone(),
                protocol: request.protocol,
                container_id: Some(request.container_id.clone()),
            };
            self.0.lock().unwrap().push(forwarder.clone());
            Ok(forwarder)
        }

        async fn close(&self, forwarder_id: &str) -> Result<(), TunnelError> {
            self.0.lock().unwrap().retain(|f| f.id != forwarder_id);
            Ok(())
        }

        async fn list_open(&self) -> Result<Vec<Forwarder>, TunnelError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct AlwaysHttp;

    #[async_trait]
    impl Detect for AlwaysHttp {
        async fn detect(&self, _addr: &str) -> Protocol {
            Protocol::Http
        }
    }

    async fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("state.json")).await.unwrap();
        let manager = Manager::new(
            Arc::new(store),
            Arc::new(OneContainer),
            Arc::new(Tunnels::default()),
            Arc::new(AlwaysHttp),
            Arc::new(SessionCache::new()),
            ManagerSettings {
                target_host: "localhost".into(),
                adapter_timeout: Duration::from_secs(1),
            },
        );
        let state = AppState {
            manager: Arc::new(manager),
            converge_timeout: Duration::from_secs(2),
        };
        (dir, router(state))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn create_list_remove() {
        let (_dir, app) = app().await;

        let (status, body) = send(
            &app,
            "POST",
            "/tunnels",
            Some(serde_json::json!({ "containerId": "abc", "targetPort": 8080 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["tunnel"]["url"], "https://abc.example.app");
        assert_eq!(body["tunnel"]["protocol"], "http");

        let (status, body) = send(&app, "GET", "/tunnels", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "fwd-abc");
        assert_eq!(body[0]["containerId"], "abc");
        assert_eq!(body[0]["targetPort"], 8080);

        let (status, body) = send(&app, "DELETE", "/tunnels/abc", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({}));

        let (status, _) = send(&app, "DELETE", "/tunnels/abc", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stopped_container_is_accepted_pending() {
        let (_dir, app) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/tunnels",
            Some(serde_json::json!({ "containerId": "not-running", "targetPort": 3000 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["pending"].is_string());

        let (_, intents) = send(&app, "GET", "/intents", None).await;
        assert_eq!(intents[0]["containerId"], "not-running");
    }

    #[tokio::test]
    async fn cancel_intent_removes_tunnel() {
        let (_dir, app) = app().await;
        send(
            &app,
            "POST",
            "/tunnels",
            Some(serde_json::json!({ "containerId": "abc", "targetPort": 8080 })),
        )
        .await;

        let (status, _) = send(&app, "DELETE", "/intents/abc", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, tunnels) = send(&app, "GET", "/tunnels", None).await;
        assert_eq!(tunnels, serde_json::json!([]));

        let (status, _) = send(&app, "DELETE", "/intents/abc", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let (_dir, app) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/tunnels",
            Some(serde_json::json!({ "containerId": "", "targetPort": 8080 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "containerId is required");
    }

    #[tokio::test]
    async fn container_id_is_trimmed() {
        let (_dir, app) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/tunnels",
            Some(serde_json::json!({ "containerId": " abc\t", "targetPort": 8080 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["tunnel"]["containerId"], "abc");

        let (status, intent) = send(&app, "GET", "/intents/abc", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(intent["containerId"], "abc");
        assert_eq!(intent["targetPort"], 8080);

        let (status, _) = send(&app, "GET", "/intents/%20abc", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
