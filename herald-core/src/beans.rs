//! Message and peer beans shared by the dispatcher and the transports.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::HeraldError;
use crate::{
    now_ms, DEFAULT_APPLICATION_ID, GROUP_ALL, HERALD_SPECIFICATION_VERSION,
    MESSAGE_HEADER_REPLIES_TO, MESSAGE_HEADER_TIMESTAMP, MESSAGE_HEADER_UID,
    MESSAGE_HERALD_VERSION,
};

/// An outbound Herald message.
///
/// The uid, creation timestamp and wire version live in `headers`, exactly as
/// they travel on the wire; `subject`, `content` and `metadata` are the other
/// top-level fields of the JSON schema.
#[derive(Debug, Clone)]
pub struct Message {
    subject: String,
    content: Value,
    headers: Map<String, Value>,
    metadata: Map<String, Value>,
}

impl Message {
    /// Creates a message, stamping a fresh uid and the current timestamp.
    pub fn new(subject: impl Into<String>, content: impl Into<Value>) -> Self {
        let mut headers = Map::new();
        headers.insert(
            MESSAGE_HERALD_VERSION.to_string(),
            Value::from(HERALD_SPECIFICATION_VERSION),
        );
        headers.insert(
            MESSAGE_HEADER_UID.to_string(),
            Value::from(Uuid::new_v4().to_string()),
        );
        headers.insert(MESSAGE_HEADER_TIMESTAMP.to_string(), Value::from(now_ms()));
        Self {
            subject: subject.into(),
            content: content.into(),
            headers,
            metadata: Map::new(),
        }
    }

    /// Rebuilds a message from decoded wire parts. Missing uid/timestamp
    /// headers are left missing; the wire codec validates them.
    pub fn from_parts(
        subject: impl Into<String>,
        content: Value,
        headers: Map<String, Value>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            subject: subject.into(),
            content,
            headers,
            metadata,
        }
    }

    pub fn uid(&self) -> &str {
        self.headers
            .get(MESSAGE_HEADER_UID)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn set_content(&mut self, content: Value) {
        self.content = content;
    }

    pub fn timestamp(&self) -> u64 {
        self.headers
            .get(MESSAGE_HEADER_TIMESTAMP)
            .and_then(Value::as_u64)
            .unwrap_or_default()
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn get_header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn headers(&self) -> &Map<String, Value> {
        &self.headers
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// The `replies-to` header, when this message answers another one.
    pub fn replies_to(&self) -> Option<&str> {
        self.headers
            .get(MESSAGE_HEADER_REPLIES_TO)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// An inbound message, normalised by a transport before dispatch.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    message: Message,
    sender_uid: String,
    reply_to: Option<String>,
    access: String,
    extra: Value,
}

impl MessageReceived {
    pub fn new(
        message: Message,
        sender_uid: impl Into<String>,
        reply_to: Option<String>,
        access: impl Into<String>,
    ) -> Self {
        Self {
            message,
            sender_uid: sender_uid.into(),
            reply_to,
            access: access.into(),
            extra: Value::Null,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn uid(&self) -> &str {
        self.message.uid()
    }

    pub fn subject(&self) -> &str {
        self.message.subject()
    }

    pub fn content(&self) -> &Value {
        self.message.content()
    }

    pub fn get_header(&self, key: &str) -> Option<&Value> {
        self.message.get_header(key)
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.message.add_header(key, value);
    }

    pub fn set_content(&mut self, content: Value) {
        self.message.set_content(content);
    }

    pub fn sender_uid(&self) -> &str {
        &self.sender_uid
    }

    pub fn set_sender_uid(&mut self, sender_uid: impl Into<String>) {
        self.sender_uid = sender_uid.into();
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn set_reply_to(&mut self, reply_to: Option<String>) {
        self.reply_to = reply_to;
    }

    /// Access id of the transport this message arrived on.
    pub fn access(&self) -> &str {
        &self.access
    }

    pub fn set_access(&mut self, access: impl Into<String>) {
        self.access = access.into();
    }

    /// Transport-supplied hints used to reply without a directory lookup
    /// (reply host/port/path, sender JID, parent uid).
    pub fn extra(&self) -> &Value {
        &self.extra
    }

    pub fn set_extra(&mut self, extra: Value) {
        self.extra = extra;
    }
}

fn default_app_id() -> String {
    DEFAULT_APPLICATION_ID.to_string()
}

/// Serialisable description of a peer, as exchanged in discovery messages
/// and directory dumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescription {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node_uid: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub accesses: Map<String, Value>,
}

/// A peer known to the directory.
///
/// Equality and hashing consider the uid only. Groups are fixed at
/// construction and always include `all` and the node uid. Accesses live in
/// a `BTreeMap` so the dispatcher tries transports in a deterministic order.
#[derive(Debug, Clone)]
pub struct Peer {
    uid: String,
    name: String,
    node_uid: String,
    node_name: String,
    app_id: String,
    groups: BTreeSet<String>,
    accesses: BTreeMap<String, Value>,
}

impl Peer {
    pub fn new(
        uid: impl Into<String>,
        app_id: impl Into<String>,
        groups: impl IntoIterator<Item = String>,
    ) -> Result<Self, HeraldError> {
        let uid = uid.into();
        if uid.is_empty() {
            return Err(HeraldError::Malformed("peer uid must not be empty".into()));
        }
        let mut peer = Self {
            name: uid.clone(),
            node_uid: uid.clone(),
            node_name: uid.clone(),
            app_id: app_id.into(),
            groups: groups.into_iter().collect(),
            accesses: BTreeMap::new(),
            uid,
        };
        peer.groups.insert(GROUP_ALL.to_string());
        peer.groups.insert(peer.node_uid.clone());
        Ok(peer)
    }

    /// Builds a peer from a received description.
    pub fn from_description(description: &PeerDescription) -> Result<Self, HeraldError> {
        if description.uid.is_empty() {
            return Err(HeraldError::Malformed("peer uid must not be empty".into()));
        }
        let uid = description.uid.clone();
        let or_uid = |value: &str| {
            if value.is_empty() {
                uid.clone()
            } else {
                value.to_string()
            }
        };
        let node_uid = or_uid(&description.node_uid);
        let mut groups: BTreeSet<String> = description.groups.iter().cloned().collect();
        groups.insert(GROUP_ALL.to_string());
        groups.insert(node_uid.clone());
        Ok(Self {
            name: or_uid(&description.name),
            node_name: or_uid(&description.node_name),
            app_id: description.app_id.clone(),
            accesses: description
                .accesses
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            node_uid,
            groups,
            uid,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.name = if name.is_empty() {
            self.uid.clone()
        } else {
            name
        };
    }

    pub fn node_uid(&self) -> &str {
        &self.node_uid
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Accesses in deterministic (lexicographic) iteration order.
    pub fn accesses(&self) -> &BTreeMap<String, Value> {
        &self.accesses
    }

    pub fn get_access(&self, access_id: &str) -> Option<&Value> {
        self.accesses.get(access_id)
    }

    pub fn has_access(&self, access_id: &str) -> bool {
        self.accesses.contains_key(access_id)
    }

    pub(crate) fn set_access(&mut self, access_id: impl Into<String>, data: Value) {
        self.accesses.insert(access_id.into(), data);
    }

    pub(crate) fn unset_access(&mut self, access_id: &str) -> Option<Value> {
        self.accesses.remove(access_id)
    }

    /// Dumps this peer as an exchangeable description.
    pub fn description(&self) -> PeerDescription {
        PeerDescription {
            uid: self.uid.clone(),
            name: self.name.clone(),
            node_uid: self.node_uid.clone(),
            node_name: self.node_name.clone(),
            app_id: self.app_id.clone(),
            groups: self.groups.iter().cloned().collect(),
            accesses: self
                .accesses
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name == self.uid {
            write!(f, "{}", self.uid)
        } else {
            write!(f, "{} ({})", self.name, self.uid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_is_stamped_on_creation() {
        let msg = Message::new("example/hello", json!({"who": "world"}));
        assert_eq!(msg.subject(), "example/hello");
        assert!(!msg.uid().is_empty());
        assert!(msg.timestamp() > 0);
        assert_eq!(
            msg.get_header(MESSAGE_HERALD_VERSION).and_then(Value::as_u64),
            Some(HERALD_SPECIFICATION_VERSION)
        );
    }

    #[test]
    fn messages_get_distinct_uids() {
        let a = Message::new("s", Value::Null);
        let b = Message::new("s", Value::Null);
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn peer_gets_implicit_groups() {
        let peer = Peer::new("aaa", "demo", ["workers".to_string()]).unwrap();
        assert!(peer.is_in_group(GROUP_ALL));
        assert!(peer.is_in_group("aaa"));
        assert!(peer.is_in_group("workers"));
        assert_eq!(peer.name(), "aaa");
        assert_eq!(peer.node_uid(), "aaa");
    }

    #[test]
    fn peer_description_round_trip() {
        let mut peer = Peer::new("aaa", "demo", ["g1".to_string()]).unwrap();
        peer.set_access("http", json!(["localhost", 8080, "/herald"]));
        let desc = peer.description();
        let rebuilt = Peer::from_description(&desc).unwrap();
        assert_eq!(rebuilt, peer);
        assert_eq!(rebuilt.groups(), peer.groups());
        assert_eq!(
            rebuilt.get_access("http"),
            Some(&json!(["localhost", 8080, "/herald"]))
        );
    }

    #[test]
    fn empty_uid_is_rejected() {
        assert!(Peer::new("", "demo", []).is_err());
    }
}
