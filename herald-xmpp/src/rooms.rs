//! MUC room naming and the join bookkeeping.

use std::collections::HashSet;

use md5::{Digest, Md5};
use uuid::Uuid;

use crate::stanza::{Jid, NS_DATA_FORMS, NS_MUC_OWNER};

/// Google Talk's MUC service, which imposes a hashed room-name format.
pub const GOOGLE_MUC_DOMAIN: &str = "groupchat.google.com";

/// Room JID for a group of an application: local part `"{app}--{group}"`,
/// or just `"{app}"` for the catch-all room.
pub fn room_jid(app_id: &str, group: Option<&str>, muc_domain: &str) -> Jid {
    let name = match group {
        Some(group) => format!("{app_id}--{group}"),
        None => app_id.to_string(),
    };
    let local = if muc_domain == GOOGLE_MUC_DOMAIN {
        google_room_name(app_id, &name)
    } else {
        name
    };
    Jid::new(local, muc_domain)
}

/// Google Talk only accepts `private-chat-<uuid>` rooms: derive the uuid
/// from an MD5 of the full room name.
fn google_room_name(app_id: &str, room_name: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("cohorte-{app_id}-{room_name}").as_bytes());
    let digest: [u8; 16] = hasher.finalize().into();
    format!("private-chat-{}", Uuid::from_bytes(digest))
}

/// The owner-submitted configuration applied to freshly created rooms:
/// unlimited users, open membership, invites allowed, non-persistent,
/// fixed nicknames.
pub fn room_config_iq(room: &Jid, iq_id: &str) -> String {
    let fields = [
        ("muc#roomconfig_maxusers", "0"),
        ("muc#roomconfig_membersonly", "0"),
        ("muc#roomconfig_allowinvites", "1"),
        ("muc#roomconfig_persistentroom", "0"),
        ("x-muc#roomconfig_canchangenick", "0"),
    ];
    let mut xml = format!(
        "<iq type='set' id='{iq_id}' to='{}'><query xmlns='{NS_MUC_OWNER}'>\
         <x xmlns='{NS_DATA_FORMS}' type='submit'>",
        room.bare()
    );
    for (var, value) in fields {
        xml.push_str(&format!(
            "<field var='{var}'><value>{value}</value></field>"
        ));
    }
    xml.push_str("</x></query></iq>");
    xml
}

/// Tracks the rooms of one bootstrap round until each one resolved.
#[derive(Debug, Default)]
pub struct RoomTracker {
    pending: HashSet<String>,
    joined: HashSet<String>,
    failed: HashSet<String>,
}

impl RoomTracker {
    /// `rooms` are bare room JIDs.
    pub fn new(rooms: impl IntoIterator<Item = String>) -> Self {
        Self {
            pending: rooms.into_iter().collect(),
            joined: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    /// Marks a room joined; returns whether the room was pending.
    pub fn mark_joined(&mut self, room: &str) -> bool {
        if self.pending.remove(room) {
            self.joined.insert(room.to_string());
            true
        } else {
            false
        }
    }

    /// Marks a room failed; returns whether the room was pending.
    pub fn mark_failed(&mut self, room: &str) -> bool {
        if self.pending.remove(room) {
            self.failed.insert(room.to_string());
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self, room: &str) -> bool {
        self.pending.contains(room)
    }

    /// Every room resolved, successfully or not.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn joined(&self) -> &HashSet<String> {
        &self.joined
    }

    pub fn failed(&self) -> &HashSet<String> {
        &self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_names_follow_the_app_group_scheme() {
        let muc = "conference.chat.example";
        assert_eq!(
            room_jid("demo", Some("sensors"), muc).full(),
            "demo--sensors@conference.chat.example"
        );
        assert_eq!(room_jid("demo", None, muc).full(), "demo@conference.chat.example");
    }

    #[test]
    fn google_rooms_are_hashed_uuids() {
        let jid = room_jid("demo", Some("sensors"), GOOGLE_MUC_DOMAIN);
        let local = jid.local.as_deref().unwrap();
        assert!(local.starts_with("private-chat-"), "got {local}");
        let uuid = local.strip_prefix("private-chat-").unwrap();
        assert!(Uuid::parse_str(uuid).is_ok(), "not a uuid: {uuid}");
        // Deterministic: the same group always lands in the same room.
        assert_eq!(jid, room_jid("demo", Some("sensors"), GOOGLE_MUC_DOMAIN));
        assert_ne!(
            jid,
            room_jid("demo", Some("actuators"), GOOGLE_MUC_DOMAIN)
        );
    }

    #[test]
    fn tracker_completes_when_every_room_resolves() {
        let mut tracker = RoomTracker::new([
            "demo@muc".to_string(),
            "demo--g1@muc".to_string(),
            "demo--g2@muc".to_string(),
        ]);
        assert!(!tracker.is_done());

        assert!(tracker.mark_joined("demo@muc"));
        assert!(tracker.mark_failed("demo--g1@muc"));
        assert!(!tracker.mark_joined("unknown@muc"));
        assert!(!tracker.is_done());

        assert!(tracker.mark_joined("demo--g2@muc"));
        assert!(tracker.is_done());
        assert_eq!(tracker.joined().len(), 2);
        assert_eq!(tracker.failed().len(), 1);
    }

    #[test]
    fn double_resolution_is_ignored() {
        let mut tracker = RoomTracker::new(["demo@muc".to_string()]);
        assert!(tracker.mark_joined("demo@muc"));
        assert!(!tracker.mark_failed("demo@muc"));
        assert!(tracker.is_done());
        assert!(tracker.failed().is_empty());
    }
}
