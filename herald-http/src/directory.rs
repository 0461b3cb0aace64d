//! HTTP sub-directory: uid to address index and the sender spoof check.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use herald_core::{HeraldError, Peer, TransportDirectory};

use crate::access::HttpAccess;
use crate::ACCESS_ID;

pub struct HttpDirectory {
    local_uid: String,
    accesses: Mutex<HashMap<String, HttpAccess>>,
}

impl HttpDirectory {
    pub fn new(local_uid: impl Into<String>) -> Self {
        Self {
            local_uid: local_uid.into(),
            accesses: Mutex::new(HashMap::new()),
        }
    }

    /// Validates a claimed sender uid against its known access.
    ///
    /// `None` when the uid is unknown (keep the claim as is), `Some(false)`
    /// when the ports do not match (spoofed or stale), `Some(true)` on a
    /// match. The host is not compared: NAT rewrites it legitimately.
    pub fn check_access(&self, uid: &str, _host: &str, port: u16) -> Option<bool> {
        self.accesses
            .lock()
            .unwrap()
            .get(uid)
            .map(|access| access.port() == port)
    }

    pub fn get_access(&self, uid: &str) -> Option<HttpAccess> {
        self.accesses.lock().unwrap().get(uid).cloned()
    }
}

impl TransportDirectory for HttpDirectory {
    fn access_id(&self) -> &str {
        ACCESS_ID
    }

    fn load_access(&self, raw: &Value) -> Result<Value, HeraldError> {
        HttpAccess::load(raw).map(|access| access.dump())
    }

    fn peer_access_set(&self, peer: &Peer, data: &Value) {
        if peer.uid() == self.local_uid {
            return;
        }
        match HttpAccess::load(data) {
            Ok(access) => {
                self.accesses
                    .lock()
                    .unwrap()
                    .insert(peer.uid().to_string(), access);
            }
            Err(e) => tracing::warn!(uid = peer.uid(), error = %e, "invalid http access"),
        }
    }

    fn peer_access_unset(&self, peer: &Peer, _data: &Value) {
        self.accesses.lock().unwrap().remove(peer.uid());
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
    fn check_access_compares_ports() {
        let directory = HttpDirectory::new("local");
        directory.peer_access_set(&peer("p1"), &json!(["10.0.0.1", 8001, "/herald"]));

        assert_eq!(directory.check_access("p1", "10.0.0.1", 8001), Some(true));
        assert_eq!(directory.check_access("p1", "10.0.0.1", 9999), Some(false));
        assert_eq!(directory.check_access("p2", "10.0.0.1", 8001), None);
    }

    #[test]
    fn local_peer_is_not_indexed() {
        let directory = HttpDirectory::new("local");
        directory.peer_access_set(&peer("local"), &json!(["127.0.0.1", 8001, "/herald"]));
        assert!(directory.get_access("local").is_none());
    }

    #[test]
    fn unset_drops_the_index_entry() {
        let directory = HttpDirectory::new("local");
        let p = peer("p1");
        directory.peer_access_set(&p, &json!(["10.0.0.1", 8001, "/herald"]));
        directory.peer_access_unset(&p, &json!(["10.0.0.1", 8001, "/herald"]));
        assert!(directory.get_access("p1").is_none());
    }
}
