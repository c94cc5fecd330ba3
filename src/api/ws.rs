// =============================================================================
// WebSocket handler — the duplex client feed
// =============================================================================
//
// Each connection registers a session with the broadcast hub and then runs a
// single select loop: flush queued outbound messages (10 s write timeout),
// probe with a ping when nothing was written for the heartbeat window, and
// process inbound `subscribe_page` requests. Any failed or timed-out write
// closes the session.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broadcast::{InboundMessage, PageSelection};

/// A single outbound write slower than this closes the session.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// With no successful write for this long, the session is probed and closed
/// on failure.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: Arc<AppState>) {
    let session = state.hub.register();
    let (mut sender, mut receiver) = socket.split();
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            // ── Outbound: flush the session queue ───────────────────────
            batch = session.recv_batch() => {
                let mut ok = true;
                for msg in batch {
                    match serde_json::to_string(msg.as_ref()) {
                        Ok(json) => {
                            if !send_with_timeout(&mut sender, Message::Text(json)).await {
                                ok = false;
                                break;
                            }
                            last_write = Instant::now();
                        }
                        Err(e) => {
                            // Not a transport problem; skip the message.
                            warn!(error = %e, "outbound message failed to serialize");
                        }
                    }
                }
                if !ok {
                    break;
                }
            }

            // ── Heartbeat: probe an idle connection ─────────────────────
            _ = tokio::time::sleep_until(last_write + HEARTBEAT_TIMEOUT) => {
                if send_with_timeout(&mut sender, Message::Ping(Vec::new())).await {
                    last_write = Instant::now();
                } else {
                    info!(session = %session.id, "heartbeat probe failed — closing session");
                    break;
                }
            }

            // ── Inbound: page subscriptions and socket lifecycle ────────
            inbound = receiver.next() => {
                if !handle_inbound(inbound, &session, &mut sender).await {
                    break;
                }
            }
        }
    }

    state.hub.unregister(session.id);
}

/// Send one frame under the write timeout; `false` means the session is dead.
async fn send_with_timeout(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: Message,
) -> bool {
    matches!(
        tokio::time::timeout(WRITE_TIMEOUT, sender.send(msg)).await,
        Ok(Ok(()))
    )
}

/// Process one inbound frame; `false` means the session should close.
async fn handle_inbound(
    inbound: Option<Result<Message, axum::Error>>,
    session: &Arc<crate::broadcast::ClientSession>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> bool {
    match inbound {
        Some(Ok(Message::Text(text))) => {
            match serde_json::from_str::<InboundMessage>(&text) {
                Ok(InboundMessage::SubscribePage { page, page_size }) => {
                    debug!(session = %session.id, page, page_size, "page subscription updated");
                    session.set_page(PageSelection { page, page_size });
                }
                Err(e) => {
                    // Clients never see protocol errors; just log and move on.
                    debug!(error = %e, "unrecognized inbound message ignored");
                }
            }
            true
        }
        Some(Ok(Message::Ping(data))) => send_with_timeout(sender, Message::Pong(data)).await,
        Some(Ok(Message::Pong(_))) => true,
        Some(Ok(Message::Close(_))) => {
            info!(session = %session.id, "client closed the connection");
            false
        }
        Some(Ok(Message::Binary(_))) => true,
        Some(Err(e)) => {
            warn!(session = %session.id, error = %e, "receive error — closing session");
            false
        }
        None => false,
    }
}
