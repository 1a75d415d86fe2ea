use std::time::Duration;

use url::Url;

use crate::error::ClientError;

pub const DEFAULT_SIGNAL_URL: &str = "wss://signal.streamshare.dev";
pub const SIGNAL_URL_ENV: &str = "STREAMSHARE_SIGNAL_URL";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_id: String,
    /// Explicit server; when unset the hosted default is tried and the
    /// client falls back to peer-only mode if it cannot be reached.
    pub signaling_url: Option<String>,
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            signaling_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = Some(url.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolves the server to dial, consulting `STREAMSHARE_SIGNAL_URL`
    /// when no URL was configured.
    pub fn endpoint(&self) -> Result<SignalEndpoint, ClientError> {
        self.endpoint_with(std::env::var(SIGNAL_URL_ENV).ok())
    }

    fn endpoint_with(&self, env_url: Option<String>) -> Result<SignalEndpoint, ClientError> {
        let explicit = self
            .signaling_url
            .clone()
            .or_else(|| env_url.filter(|url| !url.trim().is_empty()));
        match explicit {
            Some(raw) => Ok(SignalEndpoint::Explicit(parse_signal_url(&raw)?)),
            None => Ok(SignalEndpoint::Hosted(parse_signal_url(DEFAULT_SIGNAL_URL)?)),
        }
    }
}

/// Where the client connects and how strictly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEndpoint {
    /// Hosted default; unreachable means peer-only mode.
    Hosted(Url),
    /// Configured by the caller; unreachable is fatal.
    Explicit(Url),
}

impl SignalEndpoint {
    pub fn url(&self) -> &Url {
        match self {
            SignalEndpoint::Hosted(url) | SignalEndpoint::Explicit(url) => url,
        }
    }
}

fn parse_signal_url(raw: &str) -> Result<Url, ClientError> {
    let url = Url::parse(raw).map_err(|err| ClientError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ClientError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}
