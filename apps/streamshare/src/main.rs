use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use streamshare_client::transport::webrtc::{RtcConfig, WebRtcTransportFactory};
use streamshare_client::{ClientOptions, MediaEvent, MediaStream, StreamShareClient};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PublishKind {
    Camera,
    Screen,
    Audio,
}

#[derive(Debug, Parser)]
#[command(name = "streamshare", version, about = "Join a StreamShare room from the terminal")]
struct Cli {
    /// Identity to subscribe under.
    #[arg(long, env = "STREAMSHARE_USER")]
    user: String,

    /// Session (room) to start or join.
    #[arg(long)]
    session: String,

    /// Signaling server; defaults to the hosted service.
    #[arg(long, env = "STREAMSHARE_SIGNAL_URL")]
    url: Option<String>,

    /// Join an existing session instead of starting it.
    #[arg(long)]
    join: bool,

    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,

    /// Publish a stream of this kind once in the session.
    #[arg(long, value_enum)]
    publish: Option<PublishKind>,

    /// Use host candidates only (no STUN).
    #[arg(long)]
    localhost: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let rtc = if cli.localhost {
        RtcConfig::localhost()
    } else {
        RtcConfig::default()
    };
    let factory = WebRtcTransportFactory::new(rtc).context("failed to set up webrtc")?;

    let mut options = ClientOptions::new(cli.user.clone())
        .with_connect_timeout(Duration::from_secs(cli.connect_timeout_secs));
    if let Some(url) = cli.url.clone() {
        options = options.with_signaling_url(url);
    }

    let client = StreamShareClient::subscribe(options, Arc::new(factory))
        .await
        .context("failed to reach signaling server")?;
    let mut media = client.media_events();

    if cli.join {
        client.join_session(cli.session.clone())?;
    } else {
        client.start_session(cli.session.clone())?;
    }
    info!(user = %cli.user, session = %cli.session, mode = ?client.mode(), "in session; Ctrl-C to leave");

    if let Some(kind) = cli.publish {
        let stream_id = format!("{}-{}", cli.user, format!("{kind:?}").to_lowercase());
        let stream = match kind {
            PublishKind::Camera => MediaStream::camera(stream_id),
            PublishKind::Screen => MediaStream::screen(stream_id),
            PublishKind::Audio => MediaStream::audio(stream_id),
        };
        client.publish_stream(stream)?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = media.recv() => match event {
                Ok(MediaEvent::RemoteStream { peer, stream }) => {
                    info!(peer = %peer, tracks = stream.tracks.len(), "remote stream started");
                }
                Ok(MediaEvent::RemoteTrackAdded { peer, track }) => {
                    info!(peer = %peer, track = %track.id, kind = %track.kind, "remote track added");
                }
                Ok(MediaEvent::RemoteStreamEnded { peer }) => {
                    info!(peer = %peer, "remote stream ended");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "media events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.close().await;
    info!("left session");
    Ok(())
}
