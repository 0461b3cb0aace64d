//! Three-step peer discovery, driven over plain Herald messages.
//!
//! Step 1 (introducer -> newcomer) carries the introducer's dump; the
//! receiver stages the peer and answers with its own dump (step 2). The
//! step-2 receiver stages the sender, acknowledges with step 3 and only
//! then commits its staged registration; step 3 commits the one kept on the
//! introducer side. Observers on either side therefore see the peer only
//! once it is reachable from the other side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::beans::{MessageReceived, PeerDescription};
use crate::core::Herald;
use crate::directory::{DelayedRegistration, Directory};

/// Prefix of every discovery subject.
pub const SUBJECT_DISCOVERY_PREFIX: &str = "herald/directory/discovery";

/// Initial contact: "here is my dump".
pub const SUBJECT_DISCOVERY_STEP_1: &str = "herald/directory/discovery/step1";

/// Answer to step 1: "accepted, here is mine".
pub const SUBJECT_DISCOVERY_STEP_2: &str = "herald/directory/discovery/step2";

/// Final acknowledgement from the introducer.
pub const SUBJECT_DISCOVERY_STEP_3: &str = "herald/directory/discovery/step3";

/// Patches a received description before registration, e.g. to inject the
/// observed network address of a NAT-ed sender.
pub type DumpHook =
    Box<dyn Fn(&MessageReceived, PeerDescription) -> PeerDescription + Send + Sync>;

pub struct PeerContact {
    directory: Arc<Directory>,
    hook: Option<DumpHook>,
    pending: Mutex<HashMap<String, DelayedRegistration>>,
}

impl PeerContact {
    pub fn new(directory: Arc<Directory>, hook: Option<DumpHook>) -> Self {
        Self {
            directory,
            hook,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Drops every staged registration.
    pub fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }

    /// Handles one discovery message.
    pub async fn herald_message(&self, herald: &Arc<Herald>, message: &MessageReceived) {
        match message.subject() {
            SUBJECT_DISCOVERY_STEP_1 => self.on_step1(herald, message).await,
            SUBJECT_DISCOVERY_STEP_2 => self.on_step2(herald, message).await,
            SUBJECT_DISCOVERY_STEP_3 => self.on_step3(message),
            subject => warn!(subject, "unknown discovery step"),
        }
    }

    async fn on_step1(&self, herald: &Arc<Herald>, message: &MessageReceived) {
        let description = match self.load_dump(message) {
            Some(description) => description,
            None => return,
        };
        let registration = match self.directory.register_delayed(&description) {
            Ok(registration) => registration,
            Err(e) => {
                error!(error = %e, "error registering a discovered peer");
                return;
            }
        };
        let peer_uid = match registration.peer() {
            Some(peer) => peer.uid().to_string(),
            None => return,
        };
        // Keep the staged peer until the remote side acknowledges (step 3).
        self.pending
            .lock()
            .unwrap()
            .insert(peer_uid, registration);

        let local_dump = self.local_dump();
        if let Err(e) = herald
            .reply(message, local_dump, Some(SUBJECT_DISCOVERY_STEP_2))
            .await
        {
            error!(error = %e, "could not answer discovery step 1");
        }
    }

    async fn on_step2(&self, herald: &Arc<Herald>, message: &MessageReceived) {
        let description = match self.load_dump(message) {
            Some(description) => description,
            None => return,
        };
        let registration = match self.directory.register_delayed(&description) {
            Ok(registration) => registration,
            Err(e) => {
                error!(error = %e, "error registering a peer from its own description");
                return;
            }
        };
        if registration.peer().is_none() {
            return;
        }
        // Let the remote side notify its observers first, then ours.
        if let Err(e) = herald
            .reply(message, Value::Null, Some(SUBJECT_DISCOVERY_STEP_3))
            .await
        {
            error!(error = %e, "could not acknowledge discovery step 2");
        }
        registration.notify();
    }

    fn on_step3(&self, message: &MessageReceived) {
        let registration = self
            .pending
            .lock()
            .unwrap()
            .remove(message.sender_uid());
        match registration {
            Some(registration) => {
                registration.notify();
            }
            None => debug!(
                sender = message.sender_uid(),
                "discovery acknowledgement for an unknown peer"
            ),
        }
    }

    fn load_dump(&self, message: &MessageReceived) -> Option<PeerDescription> {
        let description =
            match serde_json::from_value::<PeerDescription>(message.content().clone()) {
                Ok(description) => description,
                Err(e) => {
                    warn!(error = %e, "invalid peer description in discovery message");
                    return None;
                }
            };
        match &self.hook {
            Some(hook) => Some(hook(message, description)),
            None => Some(description),
        }
    }

    fn local_dump(&self) -> Value {
        serde_json::to_value(self.directory.get_local_peer().description())
            .unwrap_or(Value::Null)
    }
}
