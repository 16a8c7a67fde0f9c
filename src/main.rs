use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use canvas_room_core::config::Config;
use canvas_room_core::persistence::PersistenceLayer;
use canvas_room_core::protocol::ClientEvent;
use canvas_room_core::registry::Registry;
use canvas_room_core::router::Session;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Config::from_env();

    let persistence = Arc::new(PersistenceLayer::new(config.data_dir.clone()));
    let registry = Registry::new(persistence, config.room_grace);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            warn!("port {} already in use, falling back to an OS-assigned port", config.port);
            TcpListener::bind("0.0.0.0:0")
                .await
                .expect("failed to bind fallback listener")
        }
        Err(err) => panic!("failed to bind listener on {addr}: {err}"),
    };

    let bound_port = listener
        .local_addr()
        .expect("bound listener has a local address")
        .port();
    info!("canvas-room-core listening on port {bound_port}");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        let registry = registry.clone();
        let cursor_interval = config.cursor_throttle;
        tokio::spawn(async move {
            handle_connection(stream, registry, cursor_interval).await;
            log::debug!("connection from {peer_addr} closed");
        });
    }
}

/// Rejects the WebSocket handshake with a plain JSON body for health-check
/// probes; accepts every other path as a WebSocket upgrade.
fn health_check_responder(
    request: &Request,
    response: Response,
) -> Result<Response, ErrorResponse> {
    if request.uri().path() == "/api/health" {
        let body = Some(r#"{"status":"ok"}"#.to_string());
        let rejection = http::Response::builder()
            .status(200)
            .header("Content-Type", "application/json")
            .body(body)
            .expect("static health-check response is well-formed");
        return Err(rejection);
    }
    Ok(response)
}

async fn handle_connection(stream: TcpStream, registry: Arc<Registry>, cursor_interval: std::time::Duration) {
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, health_check_responder).await
    {
        Ok(ws_stream) => ws_stream,
        Err(_) => return,
    };

    let session_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = Session::new(session_id.clone(), registry, tx, cursor_interval);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to serialize outgoing event: {err}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => session.handle(event).await,
                Err(err) => warn!("session {session_id} sent a malformed event: {err}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("session {session_id} transport error: {err}");
                break;
            }
        }
    }

    session.disconnect().await;
    writer.abort();
}
