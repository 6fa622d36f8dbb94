use shared::domain::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with HTTP {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },
    #[error("no {0} is configured for this conversation")]
    NotConfigured(&'static str),
}

impl TransportError {
    pub fn request(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Request {
            url: url.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("session {0} no longer exists")]
    UnknownSession(SessionId),
    #[error("conversation has been closed")]
    Closed,
    #[error("a direct conversation holds exactly one session")]
    SingleSession,
    #[error("send failed: {0}")]
    Delivery(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push url must start with http://, https://, ws:// or wss://: {0}")]
    UnsupportedUrl(String),
    #[error("invalid push url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("push connect failed: {0}")]
    Connect(String),
    #[error("push handshake rejected: {0}")]
    Handshake(String),
}
