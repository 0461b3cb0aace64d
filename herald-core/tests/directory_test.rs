//! Directory registry invariants.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use herald_core::{
    Directory, DirectoryListener, HeraldError, LocalPeerConfig, Peer, PeerDescription,
    TransportDirectory,
};

fn local_config(uid: &str) -> LocalPeerConfig {
    LocalPeerConfig {
        uid: uid.to_string(),
        app_id: "demo".to_string(),
        ..Default::default()
    }
}

fn description(uid: &str, groups: &[&str]) -> PeerDescription {
    let mut description = PeerDescription {
        uid: uid.to_string(),
        name: String::new(),
        node_uid: String::new(),
        node_name: String::new(),
        app_id: "demo".to_string(),
        groups: groups.iter().map(|g| g.to_string()).collect(),
        accesses: serde_json::Map::new(),
    };
    description
        .accesses
        .insert("test".to_string(), json!([uid, 1]));
    description
}

#[test]
fn group_indices_stay_consistent() {
    let directory = Directory::new(local_config("local"));
    directory.register(&description("p1", &["red"])).unwrap();
    directory.register(&description("p2", &["red", "blue"])).unwrap();

    // Every peer of a group index is in get_peers and carries the group.
    for group in ["red", "blue", "all"] {
        for peer in directory.get_peers_for_group(group) {
            assert!(peer.is_in_group(group));
            assert!(directory.get_peers().contains(&peer));
        }
    }
    // Conversely every peer carrying a group is indexed under it.
    for peer in directory.get_peers() {
        for group in peer.groups() {
            assert!(
                directory.get_peers_for_group(group).contains(&peer),
                "{} missing from group {group}",
                peer.uid()
            );
        }
    }
    assert_eq!(directory.get_peers_for_group("red").len(), 2);
    assert_eq!(directory.get_peers_for_group("blue").len(), 1);
}

#[test]
fn registration_is_idempotent() {
    let directory = Directory::new(local_config("local"));
    let first = directory.register(&description("p1", &[])).unwrap().unwrap();
    let second = directory.register(&description("p1", &[])).unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(directory.get_peers().len(), 1);
    // The name defaults to the uid and is indexed.
    assert_eq!(directory.get_peers_for_name("p1").len(), 1);

    let removed = directory.unregister("p1").expect("peer must be removed");
    assert_eq!(removed.uid(), "p1");
    assert!(directory.unregister("p1").is_none());
    assert!(directory.get_peers().is_empty());
    assert!(directory.get_peers_for_group("all").is_empty());
}

#[test]
fn local_and_foreign_descriptions_are_ignored() {
    let directory = Directory::new(local_config("local"));
    assert!(directory
        .register(&description("local", &[]))
        .unwrap()
        .is_none());

    let mut foreign = description("p1", &[]);
    foreign.app_id = "other-app".to_string();
    assert!(directory.register(&foreign).unwrap().is_none());
    assert!(directory.get_peers().is_empty());
}

#[test]
fn removing_the_last_access_unregisters_the_peer() {
    let directory = Directory::new(local_config("local"));
    let mut desc = description("p1", &[]);
    desc.accesses
        .insert("second".to_string(), json!("addr"));
    directory.register(&desc).unwrap();

    directory.unset_access("p1", "test").unwrap();
    assert!(directory.get_peer("p1").is_ok(), "one access remains");

    directory.unset_access("p1", "second").unwrap();
    assert!(matches!(
        directory.get_peer("p1"),
        Err(HeraldError::UnknownPeer(_))
    ));
    assert!(directory.get_peers_for_group("all").is_empty());
}

#[test]
fn delayed_registration_is_invisible_until_notified() {
    let directory = Directory::new(local_config("local"));
    let registration = directory
        .register_delayed(&description("p1", &["red"]))
        .unwrap();
    assert!(registration.peer().is_some());
    assert!(directory.get_peer("p1").is_err());
    assert!(directory.get_peers_for_group("red").is_empty());

    let peer = registration.notify().expect("commit must register");
    assert_eq!(peer.uid(), "p1");
    assert!(directory.get_peer("p1").is_ok());
    assert_eq!(directory.get_peers_for_group("red").len(), 1);
}

#[derive(Default)]
struct RecordingListener {
    registered: AtomicUsize,
    unregistered: AtomicUsize,
}

impl DirectoryListener for RecordingListener {
    fn peer_registered(&self, _peer: &Peer) {
        self.registered.fetch_add(1, Ordering::SeqCst);
    }
    fn peer_unregistered(&self, _peer: &Peer) {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn listeners_observe_registrations_once() {
    let directory = Directory::new(local_config("local"));
    let listener = Arc::new(RecordingListener::default());
    directory.add_listener(listener.clone());

    directory.register(&description("p1", &[])).unwrap();
    directory.register(&description("p1", &[])).unwrap();
    assert_eq!(listener.registered.load(Ordering::SeqCst), 1);

    directory.unregister("p1");
    directory.unregister("p1");
    assert_eq!(listener.unregistered.load(Ordering::SeqCst), 1);
}

struct RecordingSubDirectory {
    set: Mutex<Vec<String>>,
    unset: Mutex<Vec<String>>,
}

impl TransportDirectory for RecordingSubDirectory {
    fn access_id(&self) -> &str {
        "test"
    }

    fn load_access(&self, raw: &Value) -> Result<Value, HeraldError> {
        raw.as_array()
            .map(|_| raw.clone())
            .ok_or_else(|| HeraldError::Malformed("expected an array".into()))
    }

    fn peer_access_set(&self, peer: &Peer, _data: &Value) {
        self.set.lock().unwrap().push(peer.uid().to_string());
    }

    fn peer_access_unset(&self, peer: &Peer, _data: &Value) {
        self.unset.lock().unwrap().push(peer.uid().to_string());
    }
}

#[test]
fn sub_directory_sees_access_lifecycle() {
    let directory = Directory::new(local_config("local"));
    let sub = Arc::new(RecordingSubDirectory {
        set: Mutex::new(Vec::new()),
        unset: Mutex::new(Vec::new()),
    });
    directory.register_transport_directory(sub.clone());

    directory.register(&description("p1", &[])).unwrap();
    assert_eq!(sub.set.lock().unwrap().as_slice(), ["p1"]);

    directory.unset_access("p1", "test").unwrap();
    assert_eq!(sub.unset.lock().unwrap().as_slice(), ["p1"]);
    assert!(directory.get_peer("p1").is_err());
}

#[test]
fn dump_and_load_round_trip() {
    let source = Directory::new(local_config("local-a"));
    source.register(&description("p1", &["red"])).unwrap();
    source.register(&description("p2", &[])).unwrap();

    let target = Directory::new(local_config("local-b"));
    target.load(&source.dump());
    assert!(target.get_peer("p1").is_ok());
    assert!(target.get_peer("p2").is_ok());
    assert_eq!(target.get_peers_for_group("red").len(), 1);
}
