use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use streamshare_proto::{
    decode_client_bytes, decode_client_frame, encode_frame, ClientMessage, ServerMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::{ChannelHandle, SessionRegistry};
use crate::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state.registry)
}

pub(crate) fn upgrade(ws: WebSocketUpgrade, registry: SessionRegistry) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

/// Per-socket signaling state: the outbound handle and the identity this
/// channel subscribed under, if any.
struct SignalingChannel {
    channel: ChannelHandle,
    identity: Option<String>,
}

async fn handle_socket(socket: WebSocket, registry: SessionRegistry) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut connection = SignalingChannel {
        channel: ChannelHandle::new(tx),
        identity: None,
    };
    let channel_id = connection.channel.id();

    // The writer ends once every clone of the handle is gone.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match encode_frame(&message) {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(channel = %channel_id, error = %err, "failed to encode frame"),
            }
        }
        let _ = sender.close().await;
        debug!(channel = %channel_id, "signaling writer ended");
    });

    debug!(channel = %channel_id, "signaling channel opened");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(channel = %channel_id, error = %err, "signaling socket error");
                break;
            }
        };

        let decoded = match frame {
            Message::Text(text) => decode_client_frame(&text),
            Message::Binary(data) => decode_client_bytes(&data),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match decoded {
            Ok(message) => connection.dispatch(&registry, message),
            Err(err) => {
                counter!("streamshare_signal_malformed_frames_total", 1);
                warn!(channel = %channel_id, error = %err, "rejecting malformed signaling frame");
            }
        }
    }

    if let Some(identity) = connection.identity.take() {
        registry.disconnect(&identity, channel_id);
        info!(user = %identity, channel = %channel_id, "participant disconnected");
    } else {
        debug!(channel = %channel_id, "anonymous signaling channel closed");
    }
}

impl SignalingChannel {
    fn dispatch(&mut self, registry: &SessionRegistry, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { user_id } => {
                if let Some(previous) = self.identity.as_deref() {
                    if previous != user_id {
                        registry.disconnect(previous, self.channel.id());
                    }
                }
                registry.subscribe(&user_id, self.channel.clone());
                self.channel.send(ServerMessage::Subscribed {
                    user_id: user_id.clone(),
                });
                info!(user = %user_id, channel = %self.channel.id(), "participant subscribed");
                self.identity = Some(user_id);
            }
            ClientMessage::StartSession { session_id } | ClientMessage::JoinSession { session_id } => {
                let Some(identity) = self.identity.as_deref() else {
                    debug!(session = %session_id, "session request before subscribe ignored");
                    return;
                };
                if let Some(roster) = registry.start_or_join(identity, &session_id) {
                    info!(
                        user = %identity,
                        session = %session_id,
                        roster = roster.len(),
                        "participant joined session"
                    );
                }
            }
            ClientMessage::LeaveSession => {
                if let Some(identity) = self.identity.as_deref() {
                    registry.leave(identity);
                    info!(user = %identity, "participant left session");
                }
            }
            relayed @ (ClientMessage::Offer { .. }
            | ClientMessage::Answer { .. }
            | ClientMessage::Ice { .. }) => {
                let kind = relayed.kind();
                let Some(sender) = self.identity.as_deref() else {
                    warn!(kind, "negotiation message from unsubscribed channel dropped");
                    return;
                };
                let Some((target, outbound)) = relayed.relay_from(sender) else {
                    return;
                };
                if registry.route(&target, outbound) {
                    counter!("streamshare_signal_relayed_total", 1, "kind" => kind);
                    debug!(from = %sender, to = %target, kind, "relayed negotiation message");
                } else {
                    counter!("streamshare_signal_relay_dropped_total", 1, "kind" => kind);
                    debug!(from = %sender, to = %target, kind, "target not subscribed; dropped");
                }
            }
        }
    }
}
