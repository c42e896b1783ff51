use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router, TypedHeader,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    config::Config,
    device::DeviceEvent,
    manager::{ConfigSnapshot, ConnectionManager},
};

/// The default port to run the server on.
pub const DEFAULT_PORT: u16 = 3123;

/// The manager the HTTP surface talks to, if one was wired up.
///
/// The reload endpoint answers service-unavailable when there is none.
#[derive(Clone)]
pub struct ManagerHandle(pub Option<Arc<ConnectionManager>>);

#[derive(Debug, Serialize)]
struct ReloadReply {
    success: bool,
    message: String,
    config: Option<ConfigSnapshot>,
}

#[derive(Debug, Serialize)]
struct StatusReply {
    connected: bool,
    config: Option<ConfigSnapshot>,
    diagnostics: serde_json::Value,
}

/// The envelope each websocket event frame is wrapped in.
#[derive(Debug, Serialize)]
struct EventFrame {
    timestamp: DateTime<Utc>,
    event: DeviceEvent,
}

async fn run(
    config: Config,
    manager: Option<Arc<ConnectionManager>>,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) {
    config.validate().expect("Configuration must be valid");

    let app = Router::new()
        .route("/device/reload", post(reload_device))
        .route("/device/status", get(device_status))
        .route("/device/events", get(events_handler))
        .route("/config", get(show_config))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each handler needs to be able to reach the manager
                .layer(Extension(ManagerHandle(manager)))
                // The service config should be known to the web server
                .layer(Extension(config.clone())),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));
    let server =
        axum::Server::bind(&addr).serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        port_reply
            .send(addr.port())
            .expect("The receiver of which port was allocated should not be dropped");
    }

    info!("listening on {}", addr);

    server.await.unwrap();
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    config: Config,
    manager: Option<Arc<ConnectionManager>>,
    allocated_port: oneshot::Sender<u16>,
) {
    run(config, manager, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(config: Config, manager: Option<Arc<ConnectionManager>>, port: u16) {
    run(config, manager, Some(port), None).await
}

async fn reload_device(Extension(manager): Extension<ManagerHandle>) -> impl IntoResponse {
    let Some(manager) = manager.0 else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReloadReply {
                success: false,
                message: "no connection manager is wired up".into(),
                config: None,
            }),
        );
    };

    match manager.reload_config(&CancellationToken::new()).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(ReloadReply {
                success: true,
                message: outcome.to_string(),
                config: Some(outcome.into_snapshot()),
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ReloadReply {
                success: false,
                message: e.to_string(),
                config: None,
            }),
        ),
    }
}

async fn device_status(Extension(manager): Extension<ManagerHandle>) -> impl IntoResponse {
    let Some(manager) = manager.0 else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusReply {
                connected: false,
                config: None,
                diagnostics: serde_json::Value::Null,
            }),
        );
    };

    (
        StatusCode::OK,
        Json(StatusReply {
            connected: manager.is_connected().await,
            config: manager.snapshot().await,
            diagnostics: manager.connection_diagnostics().await,
        }),
    )
}

async fn events_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(manager): Extension<ManagerHandle>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("Events", %addr);

        stream_events(socket, manager).instrument(span)
    })
}

async fn stream_events(mut socket: WebSocket, manager: ManagerHandle) {
    let Some(manager) = manager.0 else {
        debug!("no manager wired up, closing events socket");
        let _ = socket.close().await;
        return;
    };

    let (id, mut events) = manager.subscribe().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let frame = EventFrame {
                        timestamp: Utc::now(),
                        event,
                    };

                    let text = serde_json::to_string(&frame).expect("Serialize should work");

                    if socket.send(Message::Text(text)).await.is_err() {
                        debug!("client disconnected");
                        break;
                    }
                }
                // The manager was closed; our queue is done. Dropping the
                // socket closes it.
                None => {
                    debug!("subscriber queue closed");
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("client went away");
                    break;
                }
                Some(Ok(_)) => {
                    // Nothing to read from clients on this socket.
                }
                Some(Err(_)) => break,
            },
        }
    }

    manager.unsubscribe(id);
}

async fn show_config(Extension(config): Extension<Config>) -> impl IntoResponse {
    config.serialize_pretty()
}

async fn show_version() -> impl IntoResponse {
    format!("Radar Helm v{}\n", env!("CARGO_PKG_VERSION"))
}
