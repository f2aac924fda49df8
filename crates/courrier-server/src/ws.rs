//! HTTP and WebSocket surface.
//!
//! Wire events travel as bincode-encoded binary frames. A fresh socket
//! must send `join` as its first frame; anything else is an auth
//! rejection and the socket closes without ever touching the hub. After
//! the handshake the socket task pumps decoded client events into the hub
//! and drains the connection's outbound queue back onto the socket.
//!
//! Identity verification itself belongs to the portal's session layer in
//! front of this endpoint; by the time a `join` arrives here its identity
//! reference is taken at face value.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use courrier_hub::{Hub, InMemoryStore, StaticMembership};
use courrier_shared::protocol::{ClientEvent, ServerEvent};
use courrier_shared::types::{ConnectionId, UserId};

use crate::config::ServerConfig;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

/// Default wiring: the portal mirrors its conversation/room rosters into
/// `StaticMembership` and persists through the in-memory log; production
/// deployments swap both collaborators at this type.
pub type PortalHub = Hub<StaticMembership, InMemoryStore>;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<PortalHub>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP/WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online_identities: usize,
    max_connections: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online_identities: state.hub.roster_snapshot().await.len(),
        max_connections: state.config.max_connections,
    })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();

    if state.config.max_connections > 0
        && hub.connection_count().await >= state.config.max_connections
    {
        warn!(limit = state.config.max_connections, "Connection limit reached");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<PortalHub>) {
    let Some(identity) = await_join(&mut socket).await else {
        // Handshake failed: fatal to this connection, nothing was attached.
        let _ = socket.send(WsFrame::Close(None)).await;
        return;
    };

    let (connection_id, mut events) = hub.attach(identity).await;
    pump_socket(&mut socket, &hub, connection_id, &mut events).await;
    hub.detach(connection_id).await;
}

/// Wait for the handshake frame. `None` means the client spoke anything
/// other than a well-formed `join` first.
async fn await_join(socket: &mut WebSocket) -> Option<UserId> {
    loop {
        match socket.recv().await? {
            Ok(WsFrame::Binary(data)) => {
                return match ClientEvent::from_bytes(&data) {
                    Ok(ClientEvent::Join { identity }) => Some(identity),
                    Ok(other) => {
                        warn!(event = ?other, "First frame was not a join, rejecting");
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Undecodable handshake frame, rejecting");
                        None
                    }
                };
            }
            Ok(WsFrame::Ping(_)) | Ok(WsFrame::Pong(_)) => continue,
            Ok(_) => {
                warn!("Non-binary handshake frame, rejecting");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "Socket error before handshake");
                return None;
            }
        }
    }
}

async fn pump_socket(
    socket: &mut WebSocket,
    hub: &Arc<PortalHub>,
    connection_id: ConnectionId,
    events: &mut tokio::sync::mpsc::Receiver<ServerEvent>,
) {
    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(WsFrame::Binary(data))) => match ClientEvent::from_bytes(&data) {
                    Ok(event) => {
                        if let Err(e) = hub.clone().handle_event(connection_id, event).await {
                            // Membership and authorization failures resolve
                            // locally; the connection stays open.
                            debug!(connection = %connection_id, error = %e, "Event rejected");
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "Undecodable frame dropped");
                    }
                },
                Some(Ok(WsFrame::Close(_))) | None => {
                    debug!(connection = %connection_id, "Socket closed by client");
                    return;
                }
                Some(Ok(_)) => {
                    // Pings and pongs are answered by the ws layer; text
                    // frames are not part of the protocol.
                }
                Some(Err(e)) => {
                    debug!(connection = %connection_id, error = %e, "Socket error");
                    return;
                }
            },
            event = events.recv() => match event {
                Some(event) => match event.to_bytes() {
                    Ok(bytes) => {
                        if socket.send(WsFrame::Binary(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "Failed to encode event");
                    }
                },
                None => return,
            },
        }
    }
}
