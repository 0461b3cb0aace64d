//! Herald core: subject-addressed peer-to-peer messaging primitives.
//!
//! Responsibilities
//! ----------------
//! • Message / peer beans and the wire JSON codec.
//! • Directory: registry of discovered peers with name/group indices and
//!   delayed-notification registration for the discovery handshake.
//! • Dispatcher (`Herald`): listener registry, reply correlation, async post
//!   callbacks, transport selection, internal-subject routing.
//! • Peer contact: the three-step discovery protocol, shared by transports.
//!
//! Transports (HTTP, XMPP) live in sibling crates and plug in through the
//! [`Transport`] and [`TransportDirectory`] traits.

pub mod beans;
pub mod contact;
pub mod core;
pub mod directory;
pub mod errors;
pub mod filters;
pub mod pool;
pub mod wire;

pub use beans::{Message, MessageReceived, Peer, PeerDescription};
pub use contact::PeerContact;
pub use crate::core::{
    ErrorCallback, Herald, HeraldConfig, ListenerId, MessageListener, ReplyCallback, Target,
    Transport,
};
pub use directory::{
    DelayedRegistration, Directory, DirectoryListener, LocalPeerConfig, TransportDirectory,
};
pub use errors::HeraldError;

/// Wire format revision carried in the `herald-version` header.
pub const HERALD_SPECIFICATION_VERSION: u64 = 1;

/// Application id used when none is configured.
pub const DEFAULT_APPLICATION_ID: &str = "herald";

// Header names of the message JSON schema.
pub const MESSAGE_HERALD_VERSION: &str = "herald-version";
pub const MESSAGE_HEADER_UID: &str = "uid";
pub const MESSAGE_HEADER_TIMESTAMP: &str = "timestamp";
pub const MESSAGE_HEADER_SENDER_UID: &str = "sender-uid";
pub const MESSAGE_HEADER_TARGET_PEER: &str = "target-peer";
pub const MESSAGE_HEADER_TARGET_GROUP: &str = "target-group";
pub const MESSAGE_HEADER_REPLIES_TO: &str = "replies-to";

/// Namespace prefix of every internal subject.
pub const SUBJECT_PREFIX: &str = "herald/";

/// Subject of messages whose body could not be decoded as a Herald message.
pub const SUBJECT_RAW: &str = "herald/raw";

/// Reply subject matching [`SUBJECT_RAW`].
pub const SUBJECT_RAW_REPLY: &str = "reply/herald/raw";

/// Error sent back when no listener matched an inbound subject.
pub const SUBJECT_ERROR_NO_LISTENER: &str = "herald/error/no-listener";

/// Group every peer belongs to.
pub const GROUP_ALL: &str = "all";

/// Conventional group excluding the sender at fan-out.
pub const GROUP_OTHERS: &str = "others";

/// Sender uid used when the remote identity is unknown or failed validation.
pub const UNKNOWN_SENDER_UID: &str = "<unknown>";

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
