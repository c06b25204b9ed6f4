//! WebSocket transport: one browser connection per channel.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use corelink_core::{ChannelId, Frame, SampleKind};
use corelink_session::{ChannelRegistry, LogicalStream};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::mpsc;

use crate::protocol::ClientMessage;

/// WebSocket handler state.
#[derive(Debug, Clone)]
pub struct WsState {
    pub registry: Arc<ChannelRegistry>,
}

impl WsState {
    #[must_use]
    pub const fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }
}

/// Command execution channel.
pub async fn exec_ws(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_channel(socket, state, LogicalStream::Exec, None))
}

/// Log tail channel for one container.
pub async fn logs_ws(
    ws: WebSocketUpgrade,
    Path(container_id): Path<String>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        serve_channel(socket, state, LogicalStream::LogTail, Some(container_id))
    })
}

/// GPU sample channel.
pub async fn gpu_ws(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        serve_channel(socket, state, LogicalStream::Poll(SampleKind::Gpu), None)
    })
}

/// System sample channel.
pub async fn system_ws(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        serve_channel(socket, state, LogicalStream::Poll(SampleKind::System), None)
    })
}

async fn serve_channel(
    socket: WebSocket,
    state: WsState,
    stream: LogicalStream,
    selector: Option<String>,
) {
    let (mut sender, receiver) = socket.split();

    let (id, outbound) = match state.registry.open(stream, selector).await {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!(stream = %stream, "Refusing channel: {e}");
            if let Ok(json) = Frame::error(e.to_string()).to_json() {
                let _ = sender.send(Message::Text(json.into())).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    let mut send_task = tokio::spawn(forward_frames(outbound, sender));
    let mut recv_task = tokio::spawn(dispatch_messages(
        receiver,
        Arc::clone(&state.registry),
        id,
    ));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.registry.deregister(id).await;
}

async fn forward_frames(
    mut outbound: mpsc::Receiver<Frame>,
    mut sender: SplitSink<WebSocket, Message>,
) {
    while let Some(frame) = outbound.recv().await {
        let json = match frame.to_json() {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize frame: {e}");
                continue;
            }
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

async fn dispatch_messages(
    mut receiver: SplitStream<WebSocket>,
    registry: Arc<ChannelRegistry>,
    id: ChannelId,
) {
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => Ok(text.as_str().to_owned()),
            Ok(Message::Binary(data)) => {
                String::from_utf8(data.to_vec()).map_err(|e| e.to_string())
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(channel_id = %id, "WebSocket error: {e}");
                break;
            }
        };

        let parsed = text.and_then(|t| ClientMessage::parse(&t).map_err(|e| e.to_string()));
        let client_msg = match parsed {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(channel_id = %id, "Invalid client message: {e}");
                if registry
                    .notify(id, Frame::error(format!("Invalid message: {e}")))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        // Rejections are reported to the client by the registry.
        match registry.route(id, client_msg.into()).await {
            Err(e) if e.to_frame().is_none() => break,
            _ => {}
        }
    }
}

/// Create the WebSocket router.
#[must_use]
pub fn create_ws_router(registry: Arc<ChannelRegistry>) -> Router {
    Router::new()
        .route("/api/commands/ws/exec", get(exec_ws))
        .route("/api/logs/ws/{container_id}", get(logs_ws))
        .route("/api/gpu/ws", get(gpu_ws))
        .route("/api/system/ws", get(system_ws))
        .with_state(WsState::new(registry))
}
