//! Herald HTTP transport.
//!
//! Responsibilities
//! ----------------
//! • Servlet: receive messages over HTTP POST, expose the local peer dump
//!   over GET, drive the discovery handshake for inbound contacts.
//! • Client: per-peer POST with JSON body, bounded group fan-out.
//! • Multicast discovery: UDP heart-beat loop, liveness tracking with TTL
//!   reaping, graceful last-beat on shutdown.

pub mod access;
pub mod directory;
pub mod discovery;
pub mod packet;
pub mod servlet;
pub mod transport;

pub use access::HttpAccess;
pub use directory::HttpDirectory;
pub use discovery::{MulticastConfig, MulticastHeartbeat};
pub use servlet::{HttpServlet, HttpServletConfig};
pub use transport::HttpTransport;

/// Access id of the HTTP transport.
pub const ACCESS_ID: &str = "http";

/// Message header carrying the sender's HTTP server port.
pub const MESSAGE_HEADER_PORT: &str = "herald-port";

/// Message header carrying the sender's servlet path.
pub const MESSAGE_HEADER_PATH: &str = "herald-path";

/// Content type of Herald message bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";
