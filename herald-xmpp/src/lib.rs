//! Herald XMPP transport.
//!
//! Responsibilities
//! ----------------
//! • A long-lived XMPP client (anonymous or authenticated) with an explicit
//!   four-state lifecycle; reconnection rebuilds the client from scratch so
//!   handlers never double-bind.
//! • Multi-User Chat rooms per group: fan-out is one `groupchat` stanza,
//!   peer departure is an `unavailable` presence in the catch-all room.
//! • Peer discovery piggybacks on the catch-all room join.

pub mod bot;
pub mod directory;
pub mod rooms;
pub mod stanza;
pub mod stream;
pub mod transport;

pub use bot::{BotEvent, HeraldBot};
pub use directory::XmppDirectory;
pub use stanza::Jid;
pub use transport::{XmppConfig, XmppTransport};

/// Access id of the XMPP transport.
pub const ACCESS_ID: &str = "xmpp";
