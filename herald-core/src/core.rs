//! The Herald dispatcher: transport selection, listener fan-out, reply
//! correlation and the internal subject protocol.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::beans::{Message, MessageReceived, Peer};
use crate::contact::{PeerContact, SUBJECT_DISCOVERY_PREFIX};
use crate::directory::Directory;
use crate::errors::HeraldError;
use crate::filters::SubjectFilter;
use crate::pool::{NotificationPool, DEFAULT_QUEUE, DEFAULT_WORKERS};
use crate::{
    GROUP_ALL, GROUP_OTHERS, MESSAGE_HEADER_REPLIES_TO, SUBJECT_ERROR_NO_LISTENER, SUBJECT_PREFIX,
};

/// A transport implementation, registered under its access id.
#[async_trait]
pub trait Transport: Send + Sync {
    fn access_id(&self) -> &str;

    /// Sends a message to one peer. `extra` carries reply hints when the
    /// message answers a received one. [`HeraldError::InvalidPeerAccess`]
    /// makes the dispatcher try the peer's next access.
    async fn fire(
        &self,
        peer: Option<&Peer>,
        message: &Message,
        extra: Option<&Value>,
    ) -> Result<(), HeraldError>;

    /// Sends one message to a group of peers; returns the uids of the peers
    /// considered reached.
    async fn fire_group(
        &self,
        group: &str,
        peers: &[Peer],
        message: &Message,
    ) -> Result<HashSet<String>, HeraldError>;
}

/// A message listener, notified on the worker pool for every inbound
/// message whose subject matches one of its filters.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn herald_message(&self, herald: &Arc<Herald>, message: MessageReceived);
}

/// Handle returned by [`Herald::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Destination of a fire/send/post: a resolved peer or a uid to look up.
pub enum Target {
    Peer(Peer),
    Uid(String),
}

impl From<Peer> for Target {
    fn from(peer: Peer) -> Self {
        Target::Peer(peer)
    }
}

impl From<&Peer> for Target {
    fn from(peer: &Peer) -> Self {
        Target::Peer(peer.clone())
    }
}

impl From<&str> for Target {
    fn from(uid: &str) -> Self {
        Target::Uid(uid.to_string())
    }
}

impl From<String> for Target {
    fn from(uid: String) -> Self {
        Target::Uid(uid)
    }
}

impl From<&String> for Target {
    fn from(uid: &String) -> Self {
        Target::Uid(uid.clone())
    }
}

/// Callback invoked on the pool when a posted message gets its reply.
pub type ReplyCallback = Arc<dyn Fn(&Arc<Herald>, &MessageReceived) + Send + Sync>;

/// Callback invoked on the pool when a posted message fails remotely.
pub type ErrorCallback = Arc<dyn Fn(&Arc<Herald>, &HeraldError) + Send + Sync>;

struct PostEntry {
    on_reply: ReplyCallback,
    on_error: ErrorCallback,
}

struct ListenerEntry {
    id: u64,
    filters: Vec<SubjectFilter>,
    listener: Arc<dyn MessageListener>,
}

type WaiterRelease = Result<MessageReceived, HeraldError>;

#[derive(Debug, Clone)]
pub struct HeraldConfig {
    /// Notification pool worker count.
    pub workers: usize,
    /// Notification pool queue capacity.
    pub queue: usize,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue: DEFAULT_QUEUE,
        }
    }
}

pub struct Herald {
    directory: Arc<Directory>,
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
    waiters: Mutex<HashMap<String, oneshot::Sender<WaiterRelease>>>,
    posts: Mutex<HashMap<String, PostEntry>>,
    pool: NotificationPool,
    contact: PeerContact,
    stopped: AtomicBool,
}

impl Herald {
    /// Builds a dispatcher over the given directory. Must run inside a
    /// tokio runtime (the notification workers are spawned here).
    pub fn new(directory: Arc<Directory>, config: HeraldConfig) -> Arc<Self> {
        let contact = PeerContact::new(Arc::clone(&directory), None);
        Arc::new(Self {
            directory,
            transports: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            posts: Mutex::new(HashMap::new()),
            pool: NotificationPool::new(config.workers, config.queue),
            contact,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .write()
            .unwrap()
            .insert(transport.access_id().to_string(), transport);
    }

    pub fn unregister_transport(&self, access_id: &str) {
        self.transports.write().unwrap().remove(access_id);
    }

    /// Registers a listener on the given subject glob patterns.
    pub fn add_listener(
        &self,
        listener: Arc<dyn MessageListener>,
        patterns: &[&str],
    ) -> Result<ListenerId, HeraldError> {
        let filters = compile_filters(patterns)?;
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push(ListenerEntry {
            id,
            filters,
            listener,
        });
        Ok(ListenerId(id))
    }

    /// Replaces the patterns of a registered listener.
    pub fn set_listener_patterns(
        &self,
        id: ListenerId,
        patterns: &[&str],
    ) -> Result<bool, HeraldError> {
        let filters = compile_filters(patterns)?;
        let mut listeners = self.listeners.lock().unwrap();
        match listeners.iter_mut().find(|entry| entry.id == id.0) {
            Some(entry) => {
                entry.filters = filters;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id.0);
        listeners.len() != before
    }

    /// Fire-and-forget to a peer. Returns the message uid.
    pub async fn fire(
        &self,
        target: impl Into<Target>,
        message: &Message,
    ) -> Result<String, HeraldError> {
        self.ensure_running()?;
        let peer = self.resolve(target.into())?;
        self.fire_peer(&peer, message, None).await?;
        Ok(message.uid().to_string())
    }

    /// Fire-and-forget to every peer of a group. Returns the uids of the
    /// reached peers.
    pub async fn fire_group(
        &self,
        group: &str,
        message: &Message,
    ) -> Result<HashSet<String>, HeraldError> {
        self.ensure_running()?;
        let peers = if group == GROUP_ALL || group == GROUP_OTHERS {
            self.directory.get_peers()
        } else {
            self.directory.get_peers_for_group(group)
        };
        if peers.is_empty() {
            return Err(HeraldError::NoTransport(format!("empty group {group}")));
        }

        let transports: Vec<Arc<dyn Transport>> =
            self.transports.read().unwrap().values().cloned().collect();
        if transports.is_empty() {
            return Err(HeraldError::NoTransport(format!(
                "no transport bound for group {group}"
            )));
        }

        let mut reached: HashSet<String> = HashSet::new();
        for transport in transports {
            let missing: Vec<Peer> = peers
                .iter()
                .filter(|peer| {
                    !reached.contains(peer.uid()) && peer.has_access(transport.access_id())
                })
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }
            match transport.fire_group(group, &missing, message).await {
                Ok(uids) => reached.extend(uids),
                Err(e) => warn!(
                    access_id = transport.access_id(),
                    error = %e,
                    "group fan-out failed on transport"
                ),
            }
            if reached.len() == peers.len() {
                break;
            }
        }
        if reached.is_empty() {
            return Err(HeraldError::NoTransport(format!(
                "no peer of group {group} could be reached"
            )));
        }
        Ok(reached)
    }

    /// Blocking request/reply: fires the message and waits for its answer
    /// at most `timeout`. A zero timeout fails immediately after firing.
    pub async fn send(
        &self,
        target: impl Into<Target>,
        message: Message,
        timeout: Duration,
    ) -> Result<MessageReceived, HeraldError> {
        self.ensure_running()?;
        let uid = message.uid().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(uid.clone(), tx);

        if let Err(e) = self.fire_resolved(target.into(), &message).await {
            self.waiters.lock().unwrap().remove(&uid);
            return Err(e);
        }

        enum Outcome {
            Released(WaiterRelease),
            TimedOut,
        }

        let outcome = if timeout.is_zero() {
            Outcome::TimedOut
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(release)) => Outcome::Released(release),
                // The sender vanished without a value: shutdown path.
                Ok(Err(_)) => Outcome::Released(Err(HeraldError::Stopping)),
                Err(_) => Outcome::TimedOut,
            }
        };

        // Late replies find no waiter and are dropped silently.
        self.waiters.lock().unwrap().remove(&uid);

        match outcome {
            Outcome::Released(Ok(reply)) => Ok(reply),
            Outcome::Released(Err(HeraldError::Stopping)) => {
                Err(HeraldError::timeout("stopping", message))
            }
            Outcome::Released(Err(e)) => Err(e),
            Outcome::TimedOut => Err(HeraldError::timeout("timeout", message)),
        }
    }

    /// Asynchronous post: callbacks run on the worker pool when the reply
    /// or a remote error arrives. Returns the message uid.
    pub async fn post(
        &self,
        target: impl Into<Target>,
        message: &Message,
        on_reply: ReplyCallback,
        on_error: ErrorCallback,
    ) -> Result<String, HeraldError> {
        self.ensure_running()?;
        let uid = message.uid().to_string();
        self.posts
            .lock()
            .unwrap()
            .insert(uid.clone(), PostEntry { on_reply, on_error });
        match self.fire_resolved(target.into(), message).await {
            Ok(()) => Ok(uid),
            Err(e) => {
                self.posts.lock().unwrap().remove(&uid);
                Err(e)
            }
        }
    }

    /// Releases any waiter and post callbacks pending on `uid` with a
    /// [`HeraldError::ForgotMessage`]. Returns whether anything waited.
    pub fn forget(&self, uid: &str) -> bool {
        let mut forgotten = false;
        if let Some(tx) = self.waiters.lock().unwrap().remove(uid) {
            let _ = tx.send(Err(HeraldError::ForgotMessage(uid.to_string())));
            forgotten = true;
        }
        if self.posts.lock().unwrap().remove(uid).is_some() {
            forgotten = true;
        }
        forgotten
    }

    /// Answers a received message. The transport it arrived on is tried
    /// first, using the reply hints in `extra`; when that path is gone, the
    /// reply goes through a plain `fire` to the sender uid.
    pub async fn reply(
        &self,
        original: &MessageReceived,
        content: Value,
        subject: Option<&str>,
    ) -> Result<(), HeraldError> {
        let subject = match subject {
            Some(subject) => subject.to_string(),
            None => {
                let original_subject = original.subject();
                if original_subject.starts_with("reply/") {
                    original_subject.to_string()
                } else {
                    format!("reply/{original_subject}")
                }
            }
        };
        let mut message = Message::new(subject, content);
        message.add_header(MESSAGE_HEADER_REPLIES_TO, original.uid());

        let transport = self
            .transports
            .read()
            .unwrap()
            .get(original.access())
            .cloned();
        if let Some(transport) = transport {
            let peer = self.directory.get_peer(original.sender_uid()).ok();
            match transport
                .fire(peer.as_ref(), &message, Some(original.extra()))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => debug!(
                    access_id = original.access(),
                    error = %e,
                    "reply fast path failed, falling back to fire"
                ),
            }
        }
        self.fire(original.sender_uid(), &message).await.map(|_| ())
    }

    /// Inbound path, called by transports from their receive task.
    ///
    /// Waiter release happens synchronously here, before any listener task
    /// is enqueued, so a blocked `send` resumes at the earliest instant.
    pub async fn handle_message(self: &Arc<Self>, message: MessageReceived) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!(uid = message.uid(), "dispatcher stopped, message dropped");
            return;
        }
        let subject = message.subject().to_string();

        if subject == SUBJECT_ERROR_NO_LISTENER {
            self.handle_no_listener(&message).await;
            return;
        }
        if subject.starts_with(SUBJECT_DISCOVERY_PREFIX) {
            self.contact.herald_message(self, &message).await;
            return;
        }

        let mut consumed = false;
        if let Some(reply_to) = message.reply_to().map(str::to_string) {
            let waiter = self.waiters.lock().unwrap().remove(&reply_to);
            if let Some(tx) = waiter {
                let _ = tx.send(Ok(message.clone()));
                consumed = true;
            }
            let post = self.posts.lock().unwrap().remove(&reply_to);
            if let Some(entry) = post {
                let herald = Arc::clone(self);
                let reply = message.clone();
                self.pool
                    .enqueue(async move { (entry.on_reply)(&herald, &reply) })
                    .await;
                consumed = true;
            }
        }

        let listeners = self.matching_listeners(&subject);
        if listeners.is_empty() {
            // Internal subjects and replies never trigger the no-listener
            // error, to keep the protocol from ping-ponging.
            if !consumed && message.reply_to().is_none() && !subject.starts_with(SUBJECT_PREFIX) {
                let content = json!({"uid": message.uid(), "subject": subject});
                if let Err(e) = self
                    .reply(&message, content, Some(SUBJECT_ERROR_NO_LISTENER))
                    .await
                {
                    debug!(error = %e, "could not send no-listener error");
                }
            }
            return;
        }
        for listener in listeners {
            let herald = Arc::clone(self);
            let task_message = message.clone();
            self.pool
                .enqueue(async move {
                    listener.herald_message(&herald, task_message).await;
                })
                .await;
        }
    }

    /// Shuts the dispatcher down: pending waiters release with a timeout
    /// error, post callbacks are cleared, the pool drains. New sends fail
    /// with [`HeraldError::Stopping`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiters: Vec<_> = self.waiters.lock().unwrap().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(HeraldError::Stopping));
        }
        self.posts.lock().unwrap().clear();
        self.contact.clear();
        self.pool.shutdown().await;
    }

    fn ensure_running(&self) -> Result<(), HeraldError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(HeraldError::Stopping)
        } else {
            Ok(())
        }
    }

    fn resolve(&self, target: Target) -> Result<Peer, HeraldError> {
        match target {
            Target::Peer(peer) => Ok(peer),
            Target::Uid(uid) => self
                .directory
                .get_peer(&uid)
                .map_err(|_| HeraldError::NoTransport(format!("unknown peer {uid}"))),
        }
    }

    async fn fire_resolved(&self, target: Target, message: &Message) -> Result<(), HeraldError> {
        let peer = self.resolve(target)?;
        self.fire_peer(&peer, message, None).await
    }

    /// Walks the peer's accesses in directory order; an invalid access
    /// moves on to the next one, any other failure propagates.
    async fn fire_peer(
        &self,
        peer: &Peer,
        message: &Message,
        extra: Option<&Value>,
    ) -> Result<(), HeraldError> {
        let transports: Vec<(String, Arc<dyn Transport>)> = {
            let registry = self.transports.read().unwrap();
            peer.accesses()
                .keys()
                .filter_map(|access_id| {
                    registry
                        .get(access_id)
                        .map(|t| (access_id.clone(), Arc::clone(t)))
                })
                .collect()
        };
        if transports.is_empty() {
            return Err(HeraldError::NoTransport(format!(
                "no transport matches the accesses of {peer}"
            )));
        }
        for (access_id, transport) in transports {
            match transport.fire(Some(peer), message, extra).await {
                Ok(()) => return Ok(()),
                Err(HeraldError::InvalidPeerAccess(reason)) => {
                    debug!(%access_id, %reason, "access rejected, trying next one");
                }
                Err(e) => return Err(e),
            }
        }
        Err(HeraldError::NoTransport(format!(
            "every access of {peer} failed"
        )))
    }

    async fn handle_no_listener(self: &Arc<Self>, message: &MessageReceived) {
        let uid = message
            .content()
            .get("uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let subject = message
            .content()
            .get("subject")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if uid.is_empty() {
            warn!("no-listener error without original uid");
            return;
        }
        let waiter = self.waiters.lock().unwrap().remove(&uid);
        if let Some(tx) = waiter {
            let _ = tx.send(Err(HeraldError::NoListener {
                uid: uid.clone(),
                subject: subject.clone(),
            }));
        }
        let post = self.posts.lock().unwrap().remove(&uid);
        if let Some(entry) = post {
            warn!(%uid, %subject, "remote peer has no listener for the post");
            let error = HeraldError::NoListener { uid, subject };
            let herald = Arc::clone(self);
            self.pool
                .enqueue(async move { (entry.on_error)(&herald, &error) })
                .await;
        }
    }

    fn matching_listeners(&self, subject: &str) -> Vec<Arc<dyn MessageListener>> {
        let listeners = self.listeners.lock().unwrap();
        listeners
            .iter()
            .filter(|entry| entry.filters.iter().any(|f| f.matches(subject)))
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }
}

fn compile_filters(patterns: &[&str]) -> Result<Vec<SubjectFilter>, HeraldError> {
    if patterns.is_empty() {
        return Err(HeraldError::InvalidFilter(
            "a listener needs at least one subject pattern".into(),
        ));
    }
    patterns.iter().map(|p| SubjectFilter::new(p)).collect()
}
