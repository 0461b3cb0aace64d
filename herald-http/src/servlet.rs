//! Inbound side of the HTTP transport: the Herald servlet.
//!
//! `GET <path>` answers with the local peer description; `POST <path>`
//! receives a message. Discovery subjects are handed to the peer-contact
//! helper before they could reach user listeners; bodies that do not decode
//! as Herald messages come in as `herald/raw`.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use herald_core::{
    wire, Directory, Herald, HeraldError, MessageReceived, PeerContact, PeerDescription,
    MESSAGE_HEADER_SENDER_UID, SUBJECT_RAW, UNKNOWN_SENDER_UID,
};
use herald_core::beans::Message;
use herald_core::contact::SUBJECT_DISCOVERY_PREFIX;

use crate::access::HttpAccess;
use crate::directory::HttpDirectory;
use crate::{ACCESS_ID, CONTENT_TYPE_JSON, MESSAGE_HEADER_PATH, MESSAGE_HEADER_PORT};

/// Sender uid used when the claimed identity fails the access check.
const INVALID_SENDER_UID: &str = "<invalid>";

#[derive(Debug, Clone)]
pub struct HttpServletConfig {
    /// Address the listener binds to.
    pub bind_host: String,
    /// Host advertised in the local `http` access.
    pub advertised_host: String,
    /// Port to bind; 0 picks an ephemeral one.
    pub port: u16,
    /// Servlet path.
    pub path: String,
}

impl Default for HttpServletConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            advertised_host: "localhost".to_string(),
            port: 0,
            path: "/herald".to_string(),
        }
    }
}

struct ServletState {
    herald: Arc<Herald>,
    http_directory: Arc<HttpDirectory>,
    contact: PeerContact,
    directory: Arc<Directory>,
}

struct Running {
    handle: JoinHandle<()>,
    access: HttpAccess,
}

pub struct HttpServlet {
    directory: Arc<Directory>,
    http_directory: Arc<HttpDirectory>,
    config: HttpServletConfig,
    running: Mutex<Option<Running>>,
}

impl HttpServlet {
    pub fn new(
        directory: Arc<Directory>,
        http_directory: Arc<HttpDirectory>,
        config: HttpServletConfig,
    ) -> Self {
        Self {
            directory,
            http_directory,
            config,
            running: Mutex::new(None),
        }
    }

    /// Binds the listener, publishes the local `http` access and starts
    /// serving. Returns the effective access (the bound port when the
    /// configured one was 0).
    pub async fn start(&self, herald: Arc<Herald>) -> Result<HttpAccess, HeraldError> {
        let listener =
            tokio::net::TcpListener::bind((self.config.bind_host.as_str(), self.config.port))
                .await?;
        let port = listener.local_addr()?.port();
        let access = HttpAccess::new(&self.config.advertised_host, port, &self.config.path);

        // Patch inbound dumps with the observed sender address, so NAT-ed
        // peers stay reachable.
        let contact = PeerContact::new(
            Arc::clone(&self.directory),
            Some(Box::new(patch_dump_with_sender_address)),
        );

        let state = Arc::new(ServletState {
            herald,
            http_directory: Arc::clone(&self.http_directory),
            contact,
            directory: Arc::clone(&self.directory),
        });
        let app = Router::new()
            .route(access.path(), get(handle_get).post(handle_post))
            .with_state(state);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                error!(error = %e, "herald servlet stopped unexpectedly");
            }
        });

        self.directory
            .set_access(&self.directory.local_uid(), ACCESS_ID, access.dump())?;
        info!(port, path = access.path(), "herald servlet listening");

        *self.running.lock().unwrap() = Some(Running {
            handle,
            access: access.clone(),
        });
        Ok(access)
    }

    pub async fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(running) = running {
            running.handle.abort();
            let _ = running.handle.await;
            let _ = self
                .directory
                .unset_access(&self.directory.local_uid(), ACCESS_ID);
        }
    }

    /// The served access, once started.
    pub fn access_info(&self) -> Option<HttpAccess> {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|running| running.access.clone())
    }
}

/// Dump hook: forge the sender's `http` access from the request's extra.
fn patch_dump_with_sender_address(
    message: &MessageReceived,
    mut description: PeerDescription,
) -> PeerDescription {
    if message.access() != ACCESS_ID {
        return description;
    }
    let extra = message.extra();
    let host = extra.get("host").and_then(Value::as_str).unwrap_or("");
    let port = extra
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(0);
    if host.is_empty() || port == 0 {
        return description;
    }
    let path = extra
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or("/herald");
    description.accesses.insert(
        ACCESS_ID.to_string(),
        HttpAccess::new(host, port, path).dump(),
    );
    description
}

/// Un-maps IPv4-mapped IPv6 addresses.
fn normalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| v4.to_string())
            .unwrap_or_else(|| v6.to_string()),
        IpAddr::V4(v4) => v4.to_string(),
    }
}

async fn handle_get(State(state): State<Arc<ServletState>>) -> impl IntoResponse {
    let description = state.directory.get_local_peer().description();
    Json(serde_json::to_value(description).unwrap_or(Value::Null))
}

async fn handle_post(
    State(state): State<Arc<ServletState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let host = normalize_ip(addr.ip());
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let message = if content_type.starts_with(CONTENT_TYPE_JSON) {
        match wire::from_json(&body) {
            Ok(message) => Some(finish_herald_message(&state, message, &host)),
            Err(HeraldError::VersionMismatch { received }) => {
                warn!(?received, "dropping message with unsupported version");
                None
            }
            Err(e) => {
                debug!(error = %e, "body is not a herald message, treating as raw");
                Some(raw_message(body, &host))
            }
        }
    } else {
        Some(raw_message(body, &host))
    };

    if let Some(message) = message {
        if message.subject().starts_with(SUBJECT_DISCOVERY_PREFIX) {
            state.contact.herald_message(&state.herald, &message).await;
        } else {
            state.herald.handle_message(message).await;
        }
    }

    (
        StatusCode::OK,
        [("content-type", CONTENT_TYPE_JSON)],
        String::new(),
    )
}

/// Completes an inbound Herald message with transport data: reply extra,
/// access id and the access-checked sender uid.
fn finish_herald_message(
    state: &ServletState,
    mut message: MessageReceived,
    host: &str,
) -> MessageReceived {
    let port = message
        .get_header(MESSAGE_HEADER_PORT)
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(80);
    let path = message
        .get_header(MESSAGE_HEADER_PATH)
        .and_then(Value::as_str)
        .unwrap_or("/herald")
        .to_string();

    // Weak anti-spoofing: the claimed uid must match the access we know.
    let mut sender_uid = message.sender_uid().to_string();
    if state.http_directory.check_access(&sender_uid, host, port) == Some(false) {
        warn!(claimed = %sender_uid, host, port, "sender uid failed the access check");
        sender_uid = INVALID_SENDER_UID.to_string();
        message.set_sender_uid(sender_uid.clone());
        message.add_header(MESSAGE_HEADER_SENDER_UID, sender_uid);
    }

    let extra = json!({
        "host": host,
        "port": port,
        "path": path,
        "parent_uid": message.uid(),
    });
    message.set_access(ACCESS_ID);
    message.set_extra(extra);
    message
}

fn raw_message(body: String, host: &str) -> MessageReceived {
    let message = Message::from_parts(
        SUBJECT_RAW,
        Value::String(body),
        {
            let mut headers = serde_json::Map::new();
            headers.insert(
                herald_core::MESSAGE_HEADER_UID.to_string(),
                Value::from(Uuid::new_v4().to_string()),
            );
            headers
        },
        serde_json::Map::new(),
    );
    let mut received = MessageReceived::new(message, UNKNOWN_SENDER_UID, None, ACCESS_ID);
    received.set_extra(json!({"host": host, "raw": true}));
    received
}
