//! Client side of the signaling channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use streamshare_proto::{
    decode_server_bytes, decode_server_frame, encode_frame, ClientMessage, ServerMessage,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::ClientError;

/// What the reader task hands to the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Message(ServerMessage),
    Closed,
}

/// Outbound queue toward the signaling server, shared by the event loop and
/// every engine. Detached in peer-only mode or once the channel is gone, in
/// which case sends are dropped.
#[derive(Clone, Default)]
pub struct Outbox {
    tx: Arc<RwLock<Option<mpsc::UnboundedSender<ClientMessage>>>>,
}

impl Outbox {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attached(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        let outbox = Self::default();
        outbox.attach(tx);
        outbox
    }

    pub fn attach(&self, tx: mpsc::UnboundedSender<ClientMessage>) {
        *self.tx.write() = Some(tx);
    }

    pub fn detach(&self) {
        self.tx.write().take();
    }

    pub fn is_attached(&self) -> bool {
        self.tx.read().is_some()
    }

    /// Queues `message`; returns false if it was dropped.
    pub fn send(&self, message: ClientMessage) -> bool {
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else {
            trace!(
                target: "streamshare::signaling",
                kind = message.kind(),
                "no signaling channel; message dropped"
            );
            return false;
        };
        tx.send(message).is_ok()
    }
}

/// A live WebSocket to the signaling server.
pub struct SignalingLink {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingLink {
    /// Connects within `connect_timeout` and queues `subscribe` as the first
    /// frame. Inbound messages are posted to `events`, followed by a final
    /// `SignalEvent::Closed` when the socket ends.
    pub async fn connect(
        url: &Url,
        user_id: &str,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<Self, ClientError> {
        let unavailable = |reason: String| ClientError::ConnectionUnavailable {
            url: url.to_string(),
            reason,
        };
        let (socket, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| unavailable(format!("no connection after {connect_timeout:?}")))?
            .map_err(|err| unavailable(err.to_string()))?;
        debug!(target: "streamshare::signaling", url = %url, "signaling channel connected");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        let _ = outbound.send(ClientMessage::Subscribe {
            user_id: user_id.to_string(),
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match encode_frame(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "streamshare::signaling", error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(target: "streamshare::signaling", error = %err, "signaling send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let decoded = match frame {
                    Ok(Message::Text(text)) => decode_server_frame(&text),
                    Ok(Message::Binary(data)) => decode_server_bytes(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(target: "streamshare::signaling", error = %err, "signaling socket error");
                        break;
                    }
                };
                match decoded {
                    Ok(message) => {
                        if events.send(SignalEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(target: "streamshare::signaling", error = %err, "ignoring malformed server frame");
                    }
                }
            }
            let _ = events.send(SignalEvent::Closed);
        });

        Ok(Self {
            outbound,
            reader,
            writer,
        })
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    /// Stops reading and lets the writer flush what is already queued
    /// before it closes the socket.
    pub async fn shutdown(self) {
        self.reader.abort();
        drop(self.outbound);
        if tokio::time::timeout(Duration::from_secs(1), self.writer)
            .await
            .is_err()
        {
            debug!(target: "streamshare::signaling", "writer did not drain in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_outbox_drops_messages() {
        let outbox = Outbox::detached();
        assert!(!outbox.send(ClientMessage::LeaveSession));
        assert!(!outbox.is_attached());
    }

    #[test]
    fn attached_outbox_delivers_until_detached() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::attached(tx);
        let clone = outbox.clone();
        assert!(clone.send(ClientMessage::LeaveSession));
        assert_eq!(rx.try_recv().ok(), Some(ClientMessage::LeaveSession));

        outbox.detach();
        assert!(!clone.send(ClientMessage::LeaveSession));
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/ws")).expect("url");
        let (events, _rx) = mpsc::unbounded_channel();
        let result =
            SignalingLink::connect(&url, "X", Duration::from_millis(500), events).await;
        assert!(matches!(
            result,
            Err(ClientError::ConnectionUnavailable { .. })
        ));
    }
}
