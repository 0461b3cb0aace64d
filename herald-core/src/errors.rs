//! Herald error variants, one per layer of the stack.

use thiserror::Error;

use crate::beans::Message;

#[derive(Debug, Error)]
pub enum HeraldError {
    /// No transport or usable access reached the target peer.
    #[error("no transport to reach {0}")]
    NoTransport(String),

    /// One access description could not be used; the dispatcher moves on to
    /// the next access of the peer.
    #[error("invalid peer access: {0}")]
    InvalidPeerAccess(String),

    /// A send expired, or the dispatcher shut down while a caller waited.
    /// Carries the original message so the caller may retry it.
    #[error("herald timeout: {text}")]
    Timeout { text: String, message: Box<Message> },

    /// The remote dispatcher found no listener for the request.
    #[error("no listener for subject {subject} (message {uid})")]
    NoListener { uid: String, subject: String },

    /// The pending call was released by `forget`.
    #[error("forgot message {0}")]
    ForgotMessage(String),

    /// Directory lookup miss.
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    /// The dispatcher is shut down; no new sends are accepted.
    #[error("herald is stopping")]
    Stopping,

    /// Inbound message carried an unsupported `herald-version` header.
    #[error("unsupported herald version: {received:?}")]
    VersionMismatch { received: Option<u64> },

    /// The payload is not a well-formed Herald message or packet.
    #[error("malformed herald payload: {0}")]
    Malformed(String),

    /// A subject filter pattern failed to compile.
    #[error("invalid subject filter: {0}")]
    InvalidFilter(String),

    /// HTTP transport failure (connection error or non-2xx status).
    #[error("http transport error: {0}")]
    Http(String),

    /// XMPP stream-level failure.
    #[error("xmpp transport error: {0}")]
    Xmpp(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HeraldError {
    /// Timeout carrying the undelivered message.
    pub fn timeout(text: impl Into<String>, message: Message) -> Self {
        Self::Timeout {
            text: text.into(),
            message: Box::new(message),
        }
    }
}

pub type HeraldResult<T> = std::result::Result<T, HeraldError>;
