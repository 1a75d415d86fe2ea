use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use streamshare_proto::ServerMessage;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

pub type ChannelId = Uuid;

/// Outbound side of one participant's signaling channel.
///
/// Sends are queued on an unbounded channel drained by the socket's writer
/// task, so a slow or closed socket never blocks delivery to anyone else.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    id: ChannelId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ChannelHandle {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Fire-and-forget; returns false when the socket is already gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

struct ConnectionRecord {
    channel: ChannelHandle,
    session: Option<String>,
}

struct SessionState {
    membership: Mutex<Membership>,
}

#[derive(Default)]
struct Membership {
    // insertion order doubles as roster order
    members: Vec<String>,
    // set once the last member leaves; joiners holding a stale Arc retry
    closed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub sessions: usize,
    pub members: Vec<SessionStats>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: String,
    pub members: usize,
}

/// In-memory directory of participant channels and session membership.
///
/// One instance lives for the lifetime of the server process. Each session
/// has its own lock: computing the roster snapshot, mutating membership and
/// queueing the resulting notices happen while holding it, so concurrent
/// joiners of the same session always observe each other exactly once.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    connections: DashMap<String, ConnectionRecord>,
    sessions: DashMap<String, Arc<SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the connection record for `identity`; the latest channel wins.
    ///
    /// Membership is keyed by identity, so a replaced record keeps the
    /// session it was in.
    pub fn subscribe(&self, identity: &str, channel: ChannelHandle) {
        match self.inner.connections.entry(identity.to_string()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().channel.id();
                entry.get_mut().channel = channel;
                debug!(%identity, %previous, "connection record replaced");
            }
            Entry::Vacant(entry) => {
                entry.insert(ConnectionRecord {
                    channel,
                    session: None,
                });
            }
        }
        counter!("streamshare_signal_subscriptions_total", 1);
    }

    /// Adds `identity` to `session_id`, creating the session if needed.
    ///
    /// The caller receives the roster of members present before it joined and
    /// every one of those members receives a `peer-joined` notice. Returns the
    /// roster, or `None` when `identity` is not subscribed.
    pub fn start_or_join(&self, identity: &str, session_id: &str) -> Option<Vec<String>> {
        let channel = {
            let mut record = self.inner.connections.get_mut(identity)?;
            record.session = Some(session_id.to_string());
            record.channel.clone()
        };

        loop {
            let session = match self.inner.sessions.entry(session_id.to_string()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let state = Arc::new(SessionState {
                        membership: Mutex::new(Membership::default()),
                    });
                    entry.insert(Arc::clone(&state));
                    info!(session = %session_id, "session created");
                    state
                }
            };

            let mut membership = session.membership.lock();
            if membership.closed {
                drop(membership);
                self.inner
                    .sessions
                    .remove_if(session_id, |_, current| Arc::ptr_eq(current, &session));
                continue;
            }

            let roster: Vec<String> = membership
                .members
                .iter()
                .filter(|member| member.as_str() != identity)
                .cloned()
                .collect();
            if !membership.members.iter().any(|member| member == identity) {
                membership.members.push(identity.to_string());
            }

            channel.send(ServerMessage::Peers {
                peers: roster.clone(),
            });
            for member in &roster {
                self.send_to(
                    member,
                    ServerMessage::PeerJoined {
                        user_id: identity.to_string(),
                    },
                );
            }
            counter!("streamshare_signal_joins_total", 1);
            return Some(roster);
        }
    }

    /// Removes `identity` from its current session and notifies the rest.
    pub fn leave(&self, identity: &str) {
        let session_id = self
            .inner
            .connections
            .get_mut(identity)
            .and_then(|mut record| record.session.take());
        if let Some(session_id) = session_id {
            self.remove_member(&session_id, identity);
        }
    }

    /// Tears down whatever `channel` holds for `identity`: its membership and
    /// its connection record. A record already rebound to a newer channel is
    /// left alone. Safe to call repeatedly.
    pub fn disconnect(&self, identity: &str, channel: ChannelId) {
        let removed = self
            .inner
            .connections
            .remove_if(identity, |_, record| record.channel.id() == channel);
        let Some((_, record)) = removed else {
            return;
        };
        if let Some(session_id) = record.session {
            self.remove_member(&session_id, identity);
        }
    }

    /// Forwards `message` to `target` if it is subscribed. Undeliverable
    /// messages are dropped without telling the sender.
    pub fn route(&self, target: &str, message: ServerMessage) -> bool {
        self.send_to(target, message)
    }

    pub fn is_subscribed(&self, identity: &str) -> bool {
        self.inner.connections.contains_key(identity)
    }

    pub fn current_session(&self, identity: &str) -> Option<String> {
        self.inner
            .connections
            .get(identity)
            .and_then(|record| record.session.clone())
    }

    /// Current members of a session in join order; empty if it does not exist.
    pub fn members(&self, session_id: &str) -> Vec<String> {
        let Some(session) = self.session(session_id) else {
            return Vec::new();
        };
        let membership = session.membership.lock();
        membership.members.clone()
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.inner.sessions.contains_key(session_id)
    }

    pub fn stats(&self) -> RegistryStats {
        let session_ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut members: Vec<SessionStats> = session_ids
            .into_iter()
            .map(|session_id| {
                let count = self.members(&session_id).len();
                SessionStats {
                    session_id,
                    members: count,
                }
            })
            .collect();
        members.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        RegistryStats {
            connections: self.inner.connections.len(),
            sessions: members.len(),
            members,
        }
    }

    fn session(&self, session_id: &str) -> Option<Arc<SessionState>> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn remove_member(&self, session_id: &str, identity: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };

        let mut membership = session.membership.lock();
        let before = membership.members.len();
        membership.members.retain(|member| member != identity);
        if membership.members.len() == before {
            return;
        }

        for member in &membership.members {
            self.send_to(
                member,
                ServerMessage::PeerLeft {
                    user_id: identity.to_string(),
                },
            );
        }
        counter!("streamshare_signal_leaves_total", 1);

        if membership.members.is_empty() {
            membership.closed = true;
            drop(membership);
            self.inner
                .sessions
                .remove_if(session_id, |_, current| Arc::ptr_eq(current, &session));
            info!(session = %session_id, "session emptied and removed");
        }
    }

    fn send_to(&self, identity: &str, message: ServerMessage) -> bool {
        let channel = self
            .inner
            .connections
            .get(identity)
            .map(|record| record.channel.clone());
        match channel {
            Some(channel) => channel.send(message),
            None => false,
        }
    }
}
