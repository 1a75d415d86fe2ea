//! `StreamShareClient`: the public face of one participant.
//!
//! All state lives in a single spawned event loop that owns the
//! orchestrator. Commands, server messages and transport callbacks are
//! queued into it and handled one at a time; closing the client cancels
//! whatever step is in progress.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientOptions, SignalEndpoint};
use crate::error::ClientError;
use crate::media::{MediaEvent, MediaStream};
use crate::orchestrator::{PeerSummary, SessionOrchestrator};
use crate::signaling::{Outbox, SignalEvent, SignalingLink};
use crate::transport::{PeerTransportFactory, TransportEvent};

const MEDIA_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Signaling,
    /// No signaling server; sessions cannot be joined.
    PeerOnly,
}

enum ClientEvent {
    StartSession(String),
    JoinSession(String),
    Publish(MediaStream),
    Peers(oneshot::Sender<Vec<PeerSummary>>),
}

pub struct StreamShareClient {
    user_id: String,
    mode: ConnectionMode,
    commands: mpsc::UnboundedSender<ClientEvent>,
    media: broadcast::Sender<MediaEvent>,
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamShareClient {
    /// Connects to the signaling server and subscribes as
    /// `options.user_id`.
    pub async fn subscribe(
        options: ClientOptions,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Result<Self, ClientError> {
        let endpoint = options.endpoint()?;
        Self::connect_with(endpoint, options, factory).await
    }

    /// Connects to an already resolved `endpoint`.
    pub(crate) async fn connect_with(
        endpoint: SignalEndpoint,
        options: ClientOptions,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Result<Self, ClientError> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let outbox = Outbox::detached();

        let connected = SignalingLink::connect(
            endpoint.url(),
            &options.user_id,
            options.connect_timeout,
            signal_tx,
        )
        .await;
        let link = match connected {
            Ok(link) => {
                outbox.attach(link.sender());
                Some(link)
            }
            Err(err) => match endpoint {
                SignalEndpoint::Explicit(_) => return Err(err),
                SignalEndpoint::Hosted(_) => {
                    warn!(
                        target: "streamshare::signaling",
                        error = %err,
                        "hosted signaling unreachable; continuing in peer-only mode"
                    );
                    None
                }
            },
        };
        let mode = if link.is_some() {
            ConnectionMode::Signaling
        } else {
            ConnectionMode::PeerOnly
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (media, _) = broadcast::channel(MEDIA_EVENT_CAPACITY);
        let (cancel, cancel_rx) = watch::channel(false);

        let orchestrator = SessionOrchestrator::new(
            options.user_id.clone(),
            factory,
            outbox,
            transport_tx,
            media.clone(),
        );
        let task = tokio::spawn(run_event_loop(
            orchestrator,
            EventSources {
                commands: command_rx,
                signals: signal_rx,
                transport: transport_rx,
                cancel: cancel_rx,
            },
            link,
        ));

        info!(user = %options.user_id, mode = ?mode, "streamshare client ready");
        Ok(Self {
            user_id: options.user_id,
            mode,
            commands,
            media,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn start_session(&self, session_id: impl Into<String>) -> Result<(), ClientError> {
        self.dispatch(ClientEvent::StartSession(session_id.into()))
    }

    pub fn join_session(&self, session_id: impl Into<String>) -> Result<(), ClientError> {
        self.dispatch(ClientEvent::JoinSession(session_id.into()))
    }

    /// Attaches `stream` to every current and future peer connection.
    pub fn publish_stream(&self, stream: MediaStream) -> Result<(), ClientError> {
        self.dispatch(ClientEvent::Publish(stream))
    }

    /// Subscribes to remote media notifications. Dropping the receiver
    /// unsubscribes.
    pub fn media_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.media.subscribe()
    }

    /// Current engines, one per known session peer.
    pub async fn peers(&self) -> Result<Vec<PeerSummary>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(ClientEvent::Peers(tx))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Leaves the session, tears down every connection and the signaling
    /// channel. Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.cancel.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "client event loop ended abnormally");
            }
        }
    }

    fn dispatch(&self, event: ClientEvent) -> Result<(), ClientError> {
        if *self.cancel.borrow() {
            return Err(ClientError::Closed);
        }
        self.commands.send(event).map_err(|_| ClientError::Closed)
    }
}

impl Drop for StreamShareClient {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

struct EventSources {
    commands: mpsc::UnboundedReceiver<ClientEvent>,
    signals: mpsc::UnboundedReceiver<SignalEvent>,
    transport: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: watch::Receiver<bool>,
}

enum LoopEvent {
    Command(ClientEvent),
    Signal(SignalEvent),
    Transport(TransportEvent),
}

async fn run_event_loop(
    mut orchestrator: SessionOrchestrator,
    mut sources: EventSources,
    link: Option<SignalingLink>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = sources.cancel.changed() => break,
            Some(command) = sources.commands.recv() => LoopEvent::Command(command),
            Some(signal) = sources.signals.recv() => LoopEvent::Signal(signal),
            Some(event) = sources.transport.recv() => LoopEvent::Transport(event),
            else => break,
        };

        let cancelled = tokio::select! {
            biased;
            _ = sources.cancel.changed() => true,
            _ = process(&mut orchestrator, event) => false,
        };
        if cancelled {
            debug!("client closed mid-step; abandoning it");
            break;
        }
    }

    orchestrator.close().await;
    if let Some(link) = link {
        link.shutdown().await;
    }
    debug!(user = %orchestrator.local_id(), "client event loop stopped");
}

async fn process(orchestrator: &mut SessionOrchestrator, event: LoopEvent) {
    match event {
        LoopEvent::Command(ClientEvent::StartSession(session_id)) => {
            orchestrator.start_session(session_id);
        }
        LoopEvent::Command(ClientEvent::JoinSession(session_id)) => {
            orchestrator.join_session(session_id);
        }
        LoopEvent::Command(ClientEvent::Publish(stream)) => {
            orchestrator.publish(stream).await;
        }
        LoopEvent::Command(ClientEvent::Peers(reply)) => {
            let _ = reply.send(orchestrator.summaries());
        }
        LoopEvent::Signal(SignalEvent::Message(message)) => {
            orchestrator.handle_server_message(message).await;
        }
        LoopEvent::Signal(SignalEvent::Closed) => {
            orchestrator.channel_closed().await;
        }
        LoopEvent::Transport(event) => {
            orchestrator.handle_transport_event(event).await;
        }
    }
}
