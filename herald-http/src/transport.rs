//! HTTP client side of the transport: per-peer POST and group fan-out.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use herald_core::{
    wire, Directory, HeraldError, Message, Peer, Transport, MESSAGE_HEADER_REPLIES_TO,
    MESSAGE_HEADER_SENDER_UID, MESSAGE_HEADER_TARGET_GROUP, MESSAGE_HEADER_TARGET_PEER,
    SUBJECT_RAW, SUBJECT_RAW_REPLY,
};

use crate::access::HttpAccess;
use crate::{ACCESS_ID, CONTENT_TYPE_JSON, MESSAGE_HEADER_PATH, MESSAGE_HEADER_PORT};

/// Parallel requests during a group fan-out.
const GROUP_POOL_SIZE: usize = 5;

/// Overall deadline of a group fan-out.
const GROUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout of the HTTP client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTransport {
    directory: Arc<Directory>,
    client: reqwest::Client,
    /// Local servlet endpoint, advertised in outgoing headers once known.
    local_access: Mutex<Option<HttpAccess>>,
}

impl HttpTransport {
    pub fn new(directory: Arc<Directory>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("default reqwest client must build");
        Self {
            directory,
            client,
            local_access: Mutex::new(None),
        }
    }

    /// Records the local servlet endpoint (called once the servlet is up).
    pub fn set_local_access(&self, access: HttpAccess) {
        *self.local_access.lock().unwrap() = Some(access);
    }

    /// Resolves the target URL: reply hints first, the peer's `http`
    /// access otherwise.
    fn resolve_url(&self, peer: Option<&Peer>, extra: Option<&Value>) -> Option<String> {
        if let Some(extra) = extra {
            let host = extra.get("host").and_then(Value::as_str).unwrap_or("");
            if !host.is_empty() {
                let port = extra
                    .get("port")
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok())
                    .unwrap_or(0);
                let path = extra
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or("/herald");
                return Some(HttpAccess::new(host, port, path).url());
            }
        }
        peer.and_then(|peer| peer.get_access(ACCESS_ID))
            .and_then(|raw| HttpAccess::load(raw).ok())
            .map(|access| access.url())
    }

    /// Stamps the transport headers and serialises the body. Raw subjects
    /// post their content verbatim.
    fn prepare_body(
        &self,
        message: &Message,
        parent_uid: Option<&str>,
        target_peer: Option<&Peer>,
        target_group: Option<&str>,
    ) -> String {
        if is_raw_subject(message.subject()) {
            return match message.content() {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
        }
        let mut stamped = message.clone();
        stamped.add_header(MESSAGE_HEADER_SENDER_UID, self.directory.local_uid());
        if let Some(access) = self.local_access.lock().unwrap().as_ref() {
            stamped.add_header(MESSAGE_HEADER_PORT, access.port());
            stamped.add_header(MESSAGE_HEADER_PATH, access.path());
        }
        if let Some(parent_uid) = parent_uid {
            stamped.add_header(MESSAGE_HEADER_REPLIES_TO, parent_uid);
        }
        if let Some(peer) = target_peer {
            stamped.add_header(MESSAGE_HEADER_TARGET_PEER, peer.uid());
        }
        if let Some(group) = target_group {
            stamped.add_header(MESSAGE_HEADER_TARGET_GROUP, group);
        }
        wire::to_json(&stamped)
    }

    async fn post(&self, url: &str, body: String) -> Result<(), HeraldError> {
        let response = self
            .client
            .post(url)
            .header("content-type", CONTENT_TYPE_JSON)
            .body(body)
            .send()
            .await
            .map_err(|e| HeraldError::Http(format!("POST {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(HeraldError::Http(format!(
                "POST {url}: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn is_raw_subject(subject: &str) -> bool {
    subject == SUBJECT_RAW || subject == SUBJECT_RAW_REPLY
}

#[async_trait]
impl Transport for HttpTransport {
    fn access_id(&self) -> &str {
        ACCESS_ID
    }

    async fn fire(
        &self,
        peer: Option<&Peer>,
        message: &Message,
        extra: Option<&Value>,
    ) -> Result<(), HeraldError> {
        let parent_uid = extra
            .and_then(|e| e.get("parent_uid"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| message.replies_to().map(str::to_string));

        let url = self.resolve_url(peer, extra).ok_or_else(|| {
            HeraldError::InvalidPeerAccess(format!("no '{ACCESS_ID}' access found"))
        })?;
        let body = self.prepare_body(message, parent_uid.as_deref(), peer, None);
        self.post(&url, body).await
    }

    async fn fire_group(
        &self,
        group: &str,
        peers: &[Peer],
        message: &Message,
    ) -> Result<HashSet<String>, HeraldError> {
        let body = self.prepare_body(message, None, None, Some(group));
        let reached = Arc::new(Mutex::new(HashSet::new()));

        let posts = peers.iter().filter_map(|peer| {
            match self.resolve_url(Some(peer), None) {
                Some(url) => {
                    let uid = peer.uid().to_string();
                    let body = body.clone();
                    let reached = Arc::clone(&reached);
                    Some(async move {
                        match self.post(&url, body).await {
                            Ok(()) => {
                                reached.lock().unwrap().insert(uid);
                            }
                            Err(e) => warn!(%uid, error = %e, "group post failed"),
                        }
                    })
                }
                None => {
                    debug!(uid = peer.uid(), "no '{ACCESS_ID}' access for group member");
                    None
                }
            }
        });

        let fan_out = stream::iter(posts).for_each_concurrent(GROUP_POOL_SIZE, |post| post);
        if tokio::time::timeout(GROUP_TIMEOUT, fan_out).await.is_err() {
            warn!(group, "not every group member was reached in time");
        }

        let reached = reached.lock().unwrap().clone();
        Ok(reached)
    }
}
