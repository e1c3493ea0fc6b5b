use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use lib_common::core::{TopicKey, ViewerHandle};
use lib_common::sessions::model::{BranchId, DeviceId, RoomId, UserId};
use lib_common::RoomError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::rooms_logic::api::{self, ApiError};
use crate::rooms_logic::config::TlsPaths;
use crate::rooms_logic::state::AppState;

/// Which topic a viewer listens to. At most one selector may be given;
/// none means the global feed.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerQuery {
    pub room_id: Option<RoomId>,
    pub branch_id: Option<BranchId>,
    pub device_id: Option<DeviceId>,
    pub user_id: Option<UserId>,
}

impl ViewerQuery {
    pub fn topic_key(&self) -> Result<TopicKey, RoomError> {
        match (self.room_id, self.branch_id, self.device_id, self.user_id) {
            (Some(room_id), None, None, None) => Ok(TopicKey::Room(room_id)),
            (None, Some(branch_id), None, None) => Ok(TopicKey::Branch(branch_id)),
            (None, None, Some(device_id), Some(user_id)) => Ok(TopicKey::DeviceOwner { device_id, user_id }),
            (None, None, None, None) => Ok(TopicKey::AllRooms),
            (None, None, Some(_), None) | (None, None, None, Some(_)) => Err(RoomError::InvalidInput(
                "deviceId and userId must be given together".to_string(),
            )),
            _ => Err(RoomError::InvalidInput(
                "use exactly one of roomId, branchId or deviceId+userId".to_string(),
            )),
        }
    }
}

/// Builds the full HTTP and WebSocket surface.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health_handler))
        .route("/assign", post(api::assign_handler))
        .route("/pause/{room_id}", patch(api::pause_handler))
        .route("/resume/{room_id}", patch(api::resume_handler))
        .route("/cancel/{room_id}", patch(api::cancel_handler))
        .route("/finalize/{room_id}", patch(api::finalize_handler))
        .route("/extend/{room_id}", patch(api::extend_handler))
        .route("/rooms/{room_id}", get(api::room_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves the router until `shutdown` fires. TLS is used when both the
/// certificate and the key exist on disk.
pub async fn run(
    port: u16,
    tls: Option<TlsPaths>,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let tls = tls.filter(|paths| paths.cert.exists() && paths.key.exists());
    if let Some(paths) = tls {
        let tls_config = RustlsConfig::from_pem_file(&paths.cert, &paths.key).await?;
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.recv().await.ok();
            info!("Downstream server shutting down.");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        info!("Downstream server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Downstream server listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await.ok();
                info!("Downstream server shutting down.");
            })
            .await?;
    }
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ViewerQuery>,
    State(state): State<AppState>,
) -> Response {
    match query.topic_key() {
        Ok(key) => ws.on_upgrade(move |socket| handle_socket(socket, key, state)),
        Err(err) => ApiError(err).into_response(),
    }
}

/// Viewer session.
///
/// Registers the socket under its key, makes sure a consumer runs for the
/// key, then forwards every delivered payload until the client leaves, a
/// write fails or times out, or the server shuts down.
async fn handle_socket(socket: WebSocket, key: TopicKey, state: AppState) {
    let (handle, mut inbox) = ViewerHandle::new(state.viewer_buffer_size);
    let id = handle.id();
    state.registry.add_connection(key, handle);
    state.supervisor.ensure_consumer(key);
    info!(%key, connection_id = id, "Viewer connected");

    let (mut sender, mut receiver) = socket.split();

    if let TopicKey::Room(room_id) = key {
        match state.engine.room_view(room_id).await {
            Ok(view) => match serde_json::to_string(&view) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        debug!(%key, connection_id = id, "Initial snapshot not delivered");
                    }
                }
                Err(e) => warn!(%key, error = %e, "Failed to serialize initial snapshot"),
            },
            Err(e) => debug!(%key, error = %e, "No initial snapshot"),
        }
    }

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    // Inbound frames only prove liveness.
                    Some(Ok(_)) => {}
                }
            }
            outbound = inbox.next() => {
                let Some(payload) = outbound else { break };
                let write = sender.send(Message::Text(payload.to_string().into()));
                match tokio::time::timeout(state.viewer_write_timeout, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(%key, connection_id = id, error = %e, "Viewer write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(%key, connection_id = id, "Viewer write timed out");
                        break;
                    }
                }
            }
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    if let Some(handle) = state.registry.remove_connection(&key, id) {
        handle.close();
    }
    info!(%key, connection_id = id, "Viewer disconnected");
}
