//! The peer directory: uid, name and group indices over discovered peers.
//!
//! All mutation goes through the directory (peers are value objects), under
//! a single lock. Queries hand out cloned snapshots. Observers and
//! transport sub-directories are notified outside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::beans::{Peer, PeerDescription};
use crate::errors::HeraldError;
use crate::DEFAULT_APPLICATION_ID;

/// Observer of directory events. Callbacks run outside the directory lock,
/// in registration order, on the thread performing the mutation.
pub trait DirectoryListener: Send + Sync {
    fn peer_registered(&self, _peer: &Peer) {}
    fn peer_updated(&self, _peer: &Peer, _access_id: &str) {}
    fn peer_unregistered(&self, _peer: &Peer) {}
}

/// Transport-specific sub-directory, registered under its access id.
pub trait TransportDirectory: Send + Sync {
    fn access_id(&self) -> &str;

    /// Validates a raw access datum from a dump. Returning the canonical
    /// form; an error keeps the raw value in place.
    fn load_access(&self, raw: &Value) -> Result<Value, HeraldError>;

    fn peer_access_set(&self, peer: &Peer, data: &Value);

    fn peer_access_unset(&self, peer: &Peer, data: &Value);
}

/// Identity of the local peer.
#[derive(Debug, Clone, Default)]
pub struct LocalPeerConfig {
    /// Generated when empty.
    pub uid: String,
    pub name: String,
    pub node_uid: String,
    pub node_name: String,
    /// Defaults to [`DEFAULT_APPLICATION_ID`].
    pub app_id: String,
    pub groups: Vec<String>,
}

struct Inner {
    local: Peer,
    peers: HashMap<String, Peer>,
    names: HashMap<String, HashSet<String>>,
    groups: HashMap<String, HashSet<String>>,
}

pub struct Directory {
    inner: Mutex<Inner>,
    sub_directories: Mutex<HashMap<String, Arc<dyn TransportDirectory>>>,
    listeners: Mutex<Vec<Arc<dyn DirectoryListener>>>,
}

impl Directory {
    pub fn new(config: LocalPeerConfig) -> Arc<Self> {
        let uid = if config.uid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            config.uid
        };
        let app_id = if config.app_id.is_empty() {
            DEFAULT_APPLICATION_ID.to_string()
        } else {
            config.app_id
        };
        let description = PeerDescription {
            uid,
            name: config.name,
            node_uid: config.node_uid,
            node_name: config.node_name,
            app_id,
            groups: config.groups,
            accesses: Map::new(),
        };
        let local = Peer::from_description(&description)
            .expect("local peer uid is never empty after generation");
        Arc::new(Self {
            inner: Mutex::new(Inner {
                local,
                peers: HashMap::new(),
                names: HashMap::new(),
                groups: HashMap::new(),
            }),
            sub_directories: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn register_transport_directory(&self, sub: Arc<dyn TransportDirectory>) {
        self.sub_directories
            .lock()
            .unwrap()
            .insert(sub.access_id().to_string(), sub);
    }

    pub fn add_listener(&self, listener: Arc<dyn DirectoryListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn local_uid(&self) -> String {
        self.inner.lock().unwrap().local.uid().to_string()
    }

    pub fn get_local_peer(&self) -> Peer {
        self.inner.lock().unwrap().local.clone()
    }

    pub fn app_id(&self) -> String {
        self.inner.lock().unwrap().local.app_id().to_string()
    }

    pub fn get_peer(&self, uid: &str) -> Result<Peer, HeraldError> {
        let inner = self.inner.lock().unwrap();
        if inner.local.uid() == uid {
            return Ok(inner.local.clone());
        }
        inner
            .peers
            .get(uid)
            .cloned()
            .ok_or_else(|| HeraldError::UnknownPeer(uid.to_string()))
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.inner.lock().unwrap().peers.values().cloned().collect()
    }

    pub fn get_peers_for_name(&self, name: &str) -> Vec<Peer> {
        let inner = self.inner.lock().unwrap();
        inner
            .names
            .get(name)
            .map(|uids| {
                uids.iter()
                    .filter_map(|uid| inner.peers.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_peers_for_group(&self, group: &str) -> Vec<Peer> {
        let inner = self.inner.lock().unwrap();
        inner
            .groups
            .get(group)
            .map(|uids| {
                uids.iter()
                    .filter_map(|uid| inner.peers.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registers a peer from its description. Returns `None` when the
    /// description is the local peer or belongs to another application.
    /// Re-registration is idempotent: the existing entry is returned.
    pub fn register(&self, description: &PeerDescription) -> Result<Option<Peer>, HeraldError> {
        match self.prepare(description)? {
            Some(peer) => Ok(Some(self.commit(peer))),
            None => Ok(None),
        }
    }

    /// Same as [`register`], but the peer stays invisible to queries and
    /// observers until [`DelayedRegistration::notify`] commits it.
    pub fn register_delayed(
        self: &Arc<Self>,
        description: &PeerDescription,
    ) -> Result<DelayedRegistration, HeraldError> {
        let peer = self.prepare(description)?;
        Ok(DelayedRegistration {
            directory: Arc::clone(self),
            peer,
        })
    }

    /// Removes a peer from every index, returning it when it was known.
    pub fn unregister(&self, uid: &str) -> Option<Peer> {
        let peer = {
            let mut inner = self.inner.lock().unwrap();
            let peer = inner.peers.remove(uid)?;
            if let Some(uids) = inner.names.get_mut(peer.name()) {
                uids.remove(uid);
                if uids.is_empty() {
                    inner.names.remove(peer.name());
                }
            }
            let groups: Vec<String> = peer.groups().iter().cloned().collect();
            for group in groups {
                if let Some(uids) = inner.groups.get_mut(&group) {
                    uids.remove(uid);
                    if uids.is_empty() {
                        inner.groups.remove(&group);
                    }
                }
            }
            peer
        };
        for (access_id, data) in peer.accesses() {
            if let Some(sub) = self.sub_directory(access_id) {
                sub.peer_access_unset(&peer, data);
            }
        }
        for listener in self.listeners_snapshot() {
            listener.peer_unregistered(&peer);
        }
        debug!(uid, "peer unregistered");
        Some(peer)
    }

    /// Sets (or replaces) an access on a registered peer or the local peer,
    /// then notifies the matching sub-directory and the observers.
    pub fn set_access(
        &self,
        uid: &str,
        access_id: &str,
        data: Value,
    ) -> Result<(), HeraldError> {
        let peer = {
            let mut inner = self.inner.lock().unwrap();
            if inner.local.uid() == uid {
                inner.local.set_access(access_id, data.clone());
                inner.local.clone()
            } else {
                let peer = inner
                    .peers
                    .get_mut(uid)
                    .ok_or_else(|| HeraldError::UnknownPeer(uid.to_string()))?;
                peer.set_access(access_id, data.clone());
                peer.clone()
            }
        };
        if let Some(sub) = self.sub_directory(access_id) {
            sub.peer_access_set(&peer, &data);
        }
        for listener in self.listeners_snapshot() {
            listener.peer_updated(&peer, access_id);
        }
        Ok(())
    }

    /// Drops an access. Removing the last access of a remote peer
    /// unregisters it.
    pub fn unset_access(&self, uid: &str, access_id: &str) -> Result<(), HeraldError> {
        let (peer, data, remaining, is_local) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.local.uid() == uid {
                let data = inner.local.unset_access(access_id);
                (inner.local.clone(), data, 1, true)
            } else {
                let peer = inner
                    .peers
                    .get_mut(uid)
                    .ok_or_else(|| HeraldError::UnknownPeer(uid.to_string()))?;
                let data = peer.unset_access(access_id);
                let remaining = peer.accesses().len();
                (peer.clone(), data, remaining, false)
            }
        };
        if let Some(data) = data {
            if let Some(sub) = self.sub_directory(access_id) {
                sub.peer_access_unset(&peer, &data);
            }
            for listener in self.listeners_snapshot() {
                listener.peer_updated(&peer, access_id);
            }
        }
        if !is_local && remaining == 0 {
            self.unregister(uid);
        }
        Ok(())
    }

    /// Dumps all registered (remote) peers as a uid -> description map.
    pub fn dump(&self) -> Map<String, Value> {
        let descriptions: Vec<PeerDescription> = {
            let inner = self.inner.lock().unwrap();
            inner.peers.values().map(Peer::description).collect()
        };
        let mut dump = Map::new();
        for description in descriptions {
            let uid = description.uid.clone();
            if let Ok(value) = serde_json::to_value(description) {
                dump.insert(uid, value);
            }
        }
        dump
    }

    /// Loads the result of a [`dump`], registering every unknown peer.
    pub fn load(&self, dump: &Map<String, Value>) {
        for (uid, value) in dump {
            match serde_json::from_value::<PeerDescription>(value.clone()) {
                Ok(description) => {
                    if let Err(e) = self.register(&description) {
                        warn!(%uid, error = %e, "could not load dumped peer");
                    }
                }
                Err(e) => warn!(%uid, error = %e, "invalid peer description in dump"),
            }
        }
    }

    fn sub_directory(&self, access_id: &str) -> Option<Arc<dyn TransportDirectory>> {
        self.sub_directories.lock().unwrap().get(access_id).cloned()
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn DirectoryListener>> {
        self.listeners.lock().unwrap().clone()
    }

    /// Builds the peer bean for a description, running each access through
    /// its sub-directory. `None` when the description must be ignored.
    fn prepare(&self, description: &PeerDescription) -> Result<Option<Peer>, HeraldError> {
        let (local_uid, local_app) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.local.uid().to_string(),
                inner.local.app_id().to_string(),
            )
        };
        if description.uid == local_uid {
            return Ok(None);
        }
        if description.app_id != local_app {
            debug!(
                uid = %description.uid,
                app_id = %description.app_id,
                "ignoring peer from another application"
            );
            return Ok(None);
        }
        let mut description = description.clone();
        for (access_id, raw) in description.accesses.iter_mut() {
            if let Some(sub) = self.sub_directory(access_id) {
                match sub.load_access(raw) {
                    Ok(parsed) => *raw = parsed,
                    Err(e) => warn!(%access_id, error = %e, "keeping raw access datum"),
                }
            }
        }
        Peer::from_description(&description).map(Some)
    }

    /// Inserts a prepared peer into the indices and notifies observers.
    /// Idempotent: an already-known uid keeps its existing entry.
    fn commit(&self, peer: Peer) -> Peer {
        let (peer, fresh) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(existing) = inner.peers.get(peer.uid()) {
                (existing.clone(), false)
            } else {
                let uid = peer.uid().to_string();
                inner
                    .names
                    .entry(peer.name().to_string())
                    .or_default()
                    .insert(uid.clone());
                for group in peer.groups() {
                    inner
                        .groups
                        .entry(group.clone())
                        .or_default()
                        .insert(uid.clone());
                }
                inner.peers.insert(uid, peer.clone());
                (peer, true)
            }
        };
        if fresh {
            for (access_id, data) in peer.accesses() {
                if let Some(sub) = self.sub_directory(access_id) {
                    sub.peer_access_set(&peer, data);
                }
            }
            for listener in self.listeners_snapshot() {
                listener.peer_registered(&peer);
            }
            debug!(uid = %peer.uid(), "peer registered");
        }
        peer
    }
}

/// A staged registration: the peer becomes visible when [`notify`] runs.
///
/// [`notify`]: DelayedRegistration::notify
pub struct DelayedRegistration {
    directory: Arc<Directory>,
    peer: Option<Peer>,
}

impl DelayedRegistration {
    /// The staged peer; `None` when the description was ignored.
    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    /// Commits the registration: indices update and observers run now.
    pub fn notify(self) -> Option<Peer> {
        self.peer.map(|peer| self.directory.commit(peer))
    }
}
