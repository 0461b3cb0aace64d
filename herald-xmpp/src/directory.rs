//! XMPP sub-directory: JID to peer uid index.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use herald_core::{HeraldError, Peer, TransportDirectory};

use crate::stanza::Jid;
use crate::ACCESS_ID;

pub struct XmppDirectory {
    local_uid: String,
    jid_to_uid: Mutex<HashMap<String, String>>,
}

impl XmppDirectory {
    pub fn new(local_uid: impl Into<String>) -> Self {
        Self {
            local_uid: local_uid.into(),
            jid_to_uid: Mutex::new(HashMap::new()),
        }
    }

    /// The peer uid bound to a full JID, when known.
    pub fn from_jid(&self, jid: &str) -> Option<String> {
        self.jid_to_uid.lock().unwrap().get(jid).cloned()
    }
}

impl TransportDirectory for XmppDirectory {
    fn access_id(&self) -> &str {
        ACCESS_ID
    }

    fn load_access(&self, raw: &Value) -> Result<Value, HeraldError> {
        let jid = raw
            .as_str()
            .ok_or_else(|| HeraldError::Malformed("xmpp access must be a JID string".into()))?;
        Jid::parse(jid)?;
        Ok(raw.clone())
    }

    fn peer_access_set(&self, peer: &Peer, data: &Value) {
        if peer.uid() == self.local_uid {
            return;
        }
        if let Some(jid) = data.as_str() {
            self.jid_to_uid
                .lock()
                .unwrap()
                .insert(jid.to_string(), peer.uid().to_string());
        }
    }

    fn peer_access_unset(&self, peer: &Peer, data: &Value) {
        if let Some(jid) = data.as_str() {
            self.jid_to_uid.lock().unwrap().remove(jid);
        } else {
            // Unknown shape: sweep by uid.
            self.jid_to_uid
                .lock()
                .unwrap()
                .retain(|_, uid| uid != peer.uid());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::PeerDescription;
    use serde_json::json;

    fn peer(uid: &str) -> Peer {
        Peer::from_description(&PeerDescription {
            uid: uid.to_string(),
            name: String::new(),
            node_uid: String::new(),
            node_name: String::new(),
            app_id: "demo".to_string(),
            groups: Vec::new(),
            accesses: serde_json::Map::new(),
        })
        .unwrap()
    }

    #[test]
    fn jid_index_follows_access_lifecycle() {
        let directory = XmppDirectory::new("local");
        let p = peer("p1");
        directory.peer_access_set(&p, &json!("p1@chat.example/p1"));
        assert_eq!(
            directory.from_jid("p1@chat.example/p1"),
            Some("p1".to_string())
        );

        directory.peer_access_unset(&p, &json!("p1@chat.example/p1"));
        assert!(directory.from_jid("p1@chat.example/p1").is_none());
    }

    #[test]
    fn invalid_accesses_are_rejected() {
        let directory = XmppDirectory::new("local");
        assert!(directory.load_access(&json!(42)).is_err());
        assert!(directory.load_access(&json!("")).is_err());
        assert!(directory.load_access(&json!("peer@chat.example")).is_ok());
    }
}
