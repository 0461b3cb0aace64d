//! The XMPP transport: bot lifecycle, room bootstrap, send paths and
//! inbound normalisation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use herald_core::beans::Message;
use herald_core::contact::{SUBJECT_DISCOVERY_PREFIX, SUBJECT_DISCOVERY_STEP_1};
use herald_core::{
    wire, Directory, Herald, HeraldError, MessageReceived, Peer, PeerContact, Transport,
    GROUP_ALL, GROUP_OTHERS, MESSAGE_HEADER_REPLIES_TO, MESSAGE_HEADER_SENDER_UID,
    MESSAGE_HEADER_TARGET_GROUP, MESSAGE_HEADER_TARGET_PEER, MESSAGE_HEADER_UID, SUBJECT_RAW,
    SUBJECT_RAW_REPLY, UNKNOWN_SENDER_UID,
};

use crate::bot::{BotConfig, BotEvent, HeraldBot};
use crate::directory::XmppDirectory;
use crate::rooms::{room_config_iq, room_jid, RoomTracker};
use crate::stanza::{Jid, MessageStanza, PresenceStanza};
use crate::ACCESS_ID;

/// Delay before retrying a create/destroy that hit a transition in flight,
/// and between reconnection attempts.
const RECALL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct XmppConfig {
    /// XMPP server host.
    pub host: String,
    /// XMPP server port.
    pub port: u16,
    /// XMPP domain; defaults to `host`.
    pub domain: Option<String>,
    /// Account JID for authenticated login, `None` for anonymous.
    pub jid: Option<String>,
    pub password: Option<String>,
    /// MUC service domain; defaults to `conference.<domain>`.
    pub muc_domain: Option<String>,
    /// Whitespace keep-alive period.
    pub keepalive_interval: Duration,
}

impl Default for XmppConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5222,
            domain: None,
            jid: None,
            password: None,
            muc_domain: None,
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

impl XmppConfig {
    fn domain(&self) -> String {
        self.domain.clone().unwrap_or_else(|| self.host.clone())
    }

    fn muc_domain(&self) -> String {
        self.muc_domain
            .clone()
            .unwrap_or_else(|| format!("conference.{}", self.domain()))
    }
}

/// Bot lifecycle. Reconnection walks the full circle: a disconnected bot
/// is destroyed and a brand new one is created, so no handler survives a
/// session and none can bind twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Destroyed,
    Creating,
    Created,
    Destroying,
}

enum Request {
    Create,
    Destroy,
}

struct Inner {
    directory: Arc<Directory>,
    xmpp_directory: Arc<XmppDirectory>,
    config: XmppConfig,
    contact: PeerContact,
    state: Mutex<BotState>,
    bot: Mutex<Option<Arc<HeraldBot>>>,
    herald: Mutex<Option<Arc<Herald>>>,
    rooms: Mutex<Option<RoomTracker>>,
    shutdown: AtomicBool,
    iq_counter: AtomicU64,
}

pub struct XmppTransport {
    inner: Arc<Inner>,
}

impl XmppTransport {
    pub fn new(
        directory: Arc<Directory>,
        xmpp_directory: Arc<XmppDirectory>,
        config: XmppConfig,
    ) -> Self {
        let contact = PeerContact::new(Arc::clone(&directory), None);
        Self {
            inner: Arc::new(Inner {
                directory,
                xmpp_directory,
                config,
                contact,
                state: Mutex::new(BotState::Destroyed),
                bot: Mutex::new(None),
                herald: Mutex::new(None),
                rooms: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                iq_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Connects the bot and bootstraps the rooms. Returns immediately; the
    /// transport flips to [`BotState::Created`] once every room resolved.
    pub fn start(&self, herald: Arc<Herald>) {
        *self.inner.herald.lock().unwrap() = Some(herald);
        self.inner.shutdown.store(false, Ordering::SeqCst);
        Inner::request(&self.inner, Request::Create);
    }

    /// Tears the bot down for good (no reconnection).
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        Inner::request(&self.inner, Request::Destroy);
    }

    pub fn state(&self) -> BotState {
        *self.inner.state.lock().unwrap()
    }
}

impl Inner {
    /// Single entry point of the state machine. Requests hitting a
    /// transition in flight are re-tried after a short delay instead of
    /// being dropped or racing it.
    fn request(inner: &Arc<Inner>, request: Request) {
        let mut state = inner.state.lock().unwrap();
        match (&request, *state) {
            (Request::Create, BotState::Destroyed) => {
                *state = BotState::Creating;
                info!("xmpp bot state: creating");
                drop(state);
                let inner = Arc::clone(inner);
                tokio::spawn(async move { Inner::create_task(inner).await });
            }
            (Request::Create, BotState::Destroying) => {
                drop(state);
                Inner::recall(inner, Request::Create);
            }
            (Request::Destroy, BotState::Created) => {
                *state = BotState::Destroying;
                info!("xmpp bot state: destroying");
                drop(state);
                let inner = Arc::clone(inner);
                tokio::spawn(async move { Inner::destroy_task(inner).await });
            }
            (Request::Destroy, BotState::Creating) => {
                if inner.shutdown.load(Ordering::SeqCst) {
                    // Final teardown outruns a creation in flight.
                    *state = BotState::Destroying;
                    info!("xmpp bot state: destroying");
                    drop(state);
                    let inner = Arc::clone(inner);
                    tokio::spawn(async move { Inner::destroy_task(inner).await });
                } else {
                    drop(state);
                    Inner::recall(inner, Request::Destroy);
                }
            }
            _ => {}
        }
    }

    fn recall(inner: &Arc<Inner>, request: Request) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(RECALL_DELAY).await;
            Inner::request(&inner, request);
        });
    }

    async fn create_task(inner: Arc<Inner>) {
        let nick = inner.directory.local_uid();
        let account = inner
            .config
            .jid
            .as_deref()
            .and_then(|jid| Jid::parse(jid).ok());
        let bot_config = BotConfig {
            domain: inner.config.domain(),
            jid: account,
            password: inner.config.password.clone(),
            keepalive_interval: inner.config.keepalive_interval,
        };
        let (events_tx, events_rx) = mpsc::channel(64);
        match HeraldBot::connect(
            &inner.config.host,
            inner.config.port,
            bot_config,
            &nick,
            events_tx,
        )
        .await
        {
            Ok(bot) => Inner::adopt_bot(inner, Arc::new(bot), events_rx).await,
            Err(e) => {
                error!(
                    host = %inner.config.host,
                    port = inner.config.port,
                    error = %e,
                    "cannot connect to the xmpp server"
                );
                *inner.state.lock().unwrap() = BotState::Destroyed;
                if !inner.shutdown.load(Ordering::SeqCst) {
                    Inner::recall(&inner, Request::Create);
                }
            }
        }
    }

    /// Post-connection setup: publish the local access, join the rooms and
    /// run the event loop. The transport stays `Creating` until every room
    /// resolved.
    async fn adopt_bot(
        inner: Arc<Inner>,
        bot: Arc<HeraldBot>,
        mut events: mpsc::Receiver<BotEvent>,
    ) {
        *inner.bot.lock().unwrap() = Some(Arc::clone(&bot));

        let local = inner.directory.get_local_peer();
        // The access goes up before the rooms so that answers to our
        // step-1 stanza can already be routed back to us.
        if let Err(e) = inner.directory.set_access(
            local.uid(),
            ACCESS_ID,
            json!(bot.jid().full()),
        ) {
            error!(error = %e, "could not publish the local xmpp access");
        }

        let muc_domain = inner.config.muc_domain();
        let mut room_jids: Vec<Jid> = local
            .groups()
            .iter()
            .map(|group| room_jid(local.app_id(), Some(group), &muc_domain))
            .collect();
        room_jids.push(room_jid(local.app_id(), None, &muc_domain));

        *inner.rooms.lock().unwrap() = Some(RoomTracker::new(
            room_jids.iter().map(Jid::bare),
        ));
        debug!(count = room_jids.len(), "joining xmpp rooms");
        for room in &room_jids {
            if let Err(e) = bot
                .send_raw(PresenceStanza::muc_join(room, local.uid()))
                .await
            {
                warn!(room = %room, error = %e, "could not join room");
            }
        }

        while let Some(event) = events.recv().await {
            match event {
                BotEvent::Message(stanza) => inner.on_message(stanza).await,
                BotEvent::Presence(stanza) => inner.on_presence(stanza).await,
                BotEvent::Disconnected => {
                    warn!("xmpp bot disconnected");
                    break;
                }
            }
        }

        // The bot is gone (or shutdown drained the events): tear down what
        // is left, then walk the circle back to a fresh bot.
        let must_destroy = {
            let mut state = inner.state.lock().unwrap();
            if matches!(*state, BotState::Created | BotState::Creating) {
                *state = BotState::Destroying;
                info!("xmpp bot state: destroying");
                true
            } else {
                false
            }
        };
        if must_destroy {
            Inner::destroy_task(Arc::clone(&inner)).await;
        }
        if !inner.shutdown.load(Ordering::SeqCst) {
            Inner::request(&inner, Request::Create);
        }
    }

    async fn destroy_task(inner: Arc<Inner>) {
        let bot = inner.bot.lock().unwrap().take();
        if let Some(bot) = bot {
            bot.close().await;
        } else {
            warn!("destroying an already destroyed xmpp bot");
        }
        inner.contact.clear();
        *inner.rooms.lock().unwrap() = None;
        let local_uid = inner.directory.local_uid();
        let _ = inner.directory.unset_access(&local_uid, ACCESS_ID);
        *inner.state.lock().unwrap() = BotState::Destroyed;
        info!("xmpp bot state: destroyed");
    }

    /// All rooms resolved: the transport is usable, discovery starts.
    async fn on_ready(&self, joined: HashSet<String>, failed: HashSet<String>) {
        debug!(rooms = ?joined, "xmpp rooms joined");
        if !failed.is_empty() {
            error!(rooms = ?failed, "some xmpp rooms could not be joined");
        }
        {
            let mut state = self.state.lock().unwrap();
            if *state != BotState::Creating {
                return;
            }
            *state = BotState::Created;
        }
        info!("xmpp bot state: created");

        // Group discovery: one step-1 into the catch-all room.
        let local = self.directory.get_local_peer();
        let dump = match serde_json::to_value(local.description()) {
            Ok(dump) => dump,
            Err(e) => {
                error!(error = %e, "cannot dump the local peer");
                return;
            }
        };
        let message = Message::new(SUBJECT_DISCOVERY_STEP_1, dump);
        let room = room_jid(local.app_id(), None, &self.config.muc_domain());
        let body = self.prepare_body(&message, None, None);
        let mut stanza = MessageStanza::groupchat(room);
        stanza.subject = Some(message.subject().to_string());
        stanza.body = Some(body);
        stanza.thread = Some(message.uid().to_string());
        if let Err(e) = self.send_stanza(stanza).await {
            error!(error = %e, "could not start group discovery");
        }
    }

    async fn on_presence(&self, presence: PresenceStanza) {
        let Some(from) = presence.from.clone() else {
            return;
        };
        let bare = from.bare();
        let local_uid = self.directory.local_uid();

        // Room bootstrap: our own presence back from a pending room.
        let resolved = {
            let mut rooms = self.rooms.lock().unwrap();
            match rooms.as_mut() {
                Some(tracker)
                    if tracker.is_pending(&bare) && from.resource() == Some(local_uid.as_str()) =>
                {
                    let owner = presence.affiliation.as_deref() == Some("owner");
                    if presence.kind.as_deref() == Some("error") {
                        debug!(
                            room = %bare,
                            condition = presence.error_condition.as_deref().unwrap_or(""),
                            "error joining room"
                        );
                        tracker.mark_failed(&bare);
                    } else {
                        tracker.mark_joined(&bare);
                    }
                    if tracker.is_done() {
                        let joined = tracker.joined().clone();
                        let failed = tracker.failed().clone();
                        Some((owner, joined, failed, true))
                    } else {
                        Some((owner, HashSet::new(), HashSet::new(), false))
                    }
                }
                _ => None,
            }
        };
        if let Some((owner, joined, failed, done)) = resolved {
            if owner {
                // We created the room: apply the standard configuration.
                let iq_id = format!(
                    "roomconfig-{}",
                    self.iq_counter.fetch_add(1, Ordering::SeqCst)
                );
                let iq = room_config_iq(&from, &iq_id);
                if let Some(bot) = self.bot() {
                    let _ = bot.send_raw(iq).await;
                }
            }
            if done {
                self.on_ready(joined, failed).await;
            }
            return;
        }

        // Someone left the catch-all room: their xmpp access is stale.
        let local = self.directory.get_local_peer();
        let main_room = room_jid(local.app_id(), None, &self.config.muc_domain()).bare();
        if bare == main_room && presence.kind.as_deref() == Some("unavailable") {
            if let Some(peer_uid) = from.resource() {
                if peer_uid != local_uid
                    && self.directory.unset_access(peer_uid, ACCESS_ID).is_ok()
                {
                    info!(uid = peer_uid, "peer left the xmpp room");
                }
            }
        }
    }

    async fn on_message(&self, stanza: MessageStanza) {
        if stanza.delayed {
            // Historical delivery from the room archive.
            return;
        }
        let Some(herald) = self.herald.lock().unwrap().clone() else {
            return;
        };
        let sender_jid = stanza
            .from
            .as_ref()
            .map(Jid::full)
            .unwrap_or_default();

        let Some(subject) = stanza.subject.clone().filter(|s| !s.is_empty()) else {
            self.handle_raw(&herald, &stanza, &sender_jid).await;
            return;
        };

        let body = stanza.body.clone().unwrap_or_default();
        let mut received = match wire::from_json(&body) {
            Ok(received) => received,
            Err(HeraldError::VersionMismatch { received }) => {
                warn!(?received, %subject, "dropping message with unsupported version");
                return;
            }
            Err(e) => {
                debug!(error = %e, %subject, "undecodable body, treating as raw");
                self.handle_raw(&herald, &stanza, &sender_jid).await;
                return;
            }
        };

        let muc_domain = self.config.muc_domain();
        let muc_message = stanza.kind == "groupchat"
            || stanza
                .from
                .as_ref()
                .map(|from| from.domain == muc_domain)
                .unwrap_or(false);
        let sender_uid = if muc_message {
            stanza
                .from
                .as_ref()
                .and_then(Jid::resource)
                .unwrap_or(UNKNOWN_SENDER_UID)
                .to_string()
        } else {
            self.xmpp_directory
                .from_jid(&sender_jid)
                .unwrap_or_else(|| UNKNOWN_SENDER_UID.to_string())
        };
        received.set_sender_uid(sender_uid.clone());
        received.add_header(MESSAGE_HEADER_SENDER_UID, sender_uid);

        if received.reply_to().is_none() {
            received.set_reply_to(stanza.parent_thread.clone());
        }
        received.set_access(ACCESS_ID);
        received.set_extra(json!({
            "parent_uid": received.uid(),
            "sender_jid": sender_jid,
        }));

        if received.subject().starts_with(SUBJECT_DISCOVERY_PREFIX) {
            self.contact.herald_message(&herald, &received).await;
        } else {
            herald.handle_message(received).await;
        }
    }

    /// A stanza without a (decodable) Herald payload comes in raw.
    async fn handle_raw(&self, herald: &Arc<Herald>, stanza: &MessageStanza, sender_jid: &str) {
        let mut headers = serde_json::Map::new();
        headers.insert(
            MESSAGE_HEADER_UID.to_string(),
            Value::from(Uuid::new_v4().to_string()),
        );
        let message = Message::from_parts(
            SUBJECT_RAW,
            Value::String(stanza.body.clone().unwrap_or_default()),
            headers,
            serde_json::Map::new(),
        );
        let mut received = MessageReceived::new(message, UNKNOWN_SENDER_UID, None, ACCESS_ID);
        received.set_extra(json!({"sender_jid": sender_jid, "raw": true}));
        herald.handle_message(received).await;
    }

    fn bot(&self) -> Option<Arc<HeraldBot>> {
        self.bot.lock().unwrap().clone()
    }

    fn is_created(&self) -> bool {
        *self.state.lock().unwrap() == BotState::Created
    }

    async fn send_stanza(&self, stanza: MessageStanza) -> Result<(), HeraldError> {
        match self.bot() {
            Some(bot) => bot.send_raw(stanza.to_xml()).await,
            None => Err(HeraldError::Xmpp("no bot to send with".into())),
        }
    }

    /// Stamps the transport headers and serialises the body; raw subjects
    /// go out verbatim.
    fn prepare_body(
        &self,
        message: &Message,
        target_peer: Option<&Peer>,
        target_group: Option<&str>,
    ) -> String {
        if message.subject() == SUBJECT_RAW || message.subject() == SUBJECT_RAW_REPLY {
            return match message.content() {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
        }
        let mut stamped = message.clone();
        stamped.add_header(MESSAGE_HEADER_SENDER_UID, self.directory.local_uid());
        if let Some(peer) = target_peer {
            stamped.add_header(MESSAGE_HEADER_TARGET_PEER, peer.uid());
        }
        if let Some(group) = target_group {
            stamped.add_header(MESSAGE_HEADER_TARGET_GROUP, group);
        }
        wire::to_json(&stamped)
    }
}

#[async_trait]
impl Transport for XmppTransport {
    fn access_id(&self) -> &str {
        ACCESS_ID
    }

    async fn fire(
        &self,
        peer: Option<&Peer>,
        message: &Message,
        extra: Option<&Value>,
    ) -> Result<(), HeraldError> {
        if !self.inner.is_created() {
            // Lets the dispatcher move on to the peer's next access.
            return Err(HeraldError::InvalidPeerAccess(
                "xmpp transport not connected".into(),
            ));
        }
        let jid_text = extra
            .and_then(|e| e.get("sender_jid"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                peer.and_then(|p| p.get_access(ACCESS_ID))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                HeraldError::InvalidPeerAccess(format!("no '{ACCESS_ID}' access found"))
            })?;
        let to = Jid::parse(&jid_text)?;

        let parent_uid = extra
            .and_then(|e| e.get("parent_uid"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| message.replies_to().map(str::to_string));

        let mut stamped = message.clone();
        if let Some(parent_uid) = &parent_uid {
            stamped.add_header(MESSAGE_HEADER_REPLIES_TO, parent_uid.clone());
        }
        let body = self.inner.prepare_body(&stamped, peer, None);

        let mut stanza = MessageStanza::chat(to);
        stanza.subject = Some(stamped.subject().to_string());
        stanza.body = Some(body);
        stanza.thread = Some(stamped.uid().to_string());
        stanza.parent_thread = parent_uid;
        self.inner.send_stanza(stanza).await
    }

    async fn fire_group(
        &self,
        group: &str,
        peers: &[Peer],
        message: &Message,
    ) -> Result<HashSet<String>, HeraldError> {
        if !self.inner.is_created() {
            return Err(HeraldError::InvalidPeerAccess(
                "xmpp transport not connected".into(),
            ));
        }
        let local = self.inner.directory.get_local_peer();
        let muc_domain = self.inner.config.muc_domain();
        let room = if group == GROUP_ALL || group == GROUP_OTHERS {
            room_jid(local.app_id(), None, &muc_domain)
        } else {
            room_jid(local.app_id(), Some(group), &muc_domain)
        };

        let body = self.inner.prepare_body(message, None, Some(group));
        let mut stanza = MessageStanza::groupchat(room);
        stanza.subject = Some(message.subject().to_string());
        stanza.body = Some(body);
        stanza.thread = Some(message.uid().to_string());
        self.inner.send_stanza(stanza).await?;

        // MUC fan-out is opaque: the room reaches whoever is in it.
        Ok(peers.iter().map(|peer| peer.uid().to_string()).collect())
    }
}
