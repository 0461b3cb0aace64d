//! The long-lived XMPP client behind the transport.
//!
//! One reader task turns inbound stanzas into [`BotEvent`]s, one writer
//! task serialises outbound XML and keeps the connection alive with
//! whitespace pings. Loop-back group messages (our own nick) never leave
//! the bot. The bot carries no reconnection logic: the transport's state
//! machine reacts to [`BotEvent::Disconnected`] by building a fresh bot.

use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use herald_core::HeraldError;

use crate::stanza::{Jid, MessageStanza, PresenceStanza, ReaderEvent, StanzaReader};
use crate::stream::{StreamConfig, XmppStream};

/// Events surfaced to the transport's event loop.
#[derive(Debug)]
pub enum BotEvent {
    Message(MessageStanza),
    Presence(PresenceStanza),
    /// The connection is gone; the bot is unusable from now on.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    /// XMPP domain (defaults to the host when unset by the caller).
    pub domain: String,
    /// Account JID for PLAIN authentication, `None` for anonymous login.
    pub jid: Option<Jid>,
    pub password: Option<String>,
    /// Whitespace keep-alive period.
    pub keepalive_interval: Duration,
}

pub struct HeraldBot {
    jid: Jid,
    nick: String,
    writer_tx: mpsc::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HeraldBot {
    /// Connects over TCP and negotiates the stream. The resource (and MUC
    /// nick) is the local peer uid.
    pub async fn connect(
        host: &str,
        port: u16,
        config: BotConfig,
        nick: &str,
        events: mpsc::Sender<BotEvent>,
    ) -> Result<Self, HeraldError> {
        let io = TcpStream::connect((host, port)).await?;
        Self::from_io(io, config, nick, events).await
    }

    /// Negotiates over an already-established byte stream. Used by tests
    /// with an in-memory pipe, and by `connect`.
    pub async fn from_io<S>(
        io: S,
        config: BotConfig,
        nick: &str,
        events: mpsc::Sender<BotEvent>,
    ) -> Result<Self, HeraldError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stream = XmppStream::new(io);
        let jid = stream
            .negotiate(&StreamConfig {
                domain: config.domain.clone(),
                jid: config.jid.clone(),
                password: config.password.clone(),
                resource: nick.to_string(),
            })
            .await?;
        info!(jid = %jid, "bot connected");

        // Announce availability before anything else.
        stream.write_raw("<presence/>").await?;

        let (io, reader_state) = stream.into_parts();
        let (read_half, write_half) = tokio::io::split(io);
        let (writer_tx, writer_rx) = mpsc::channel::<String>(64);

        let reader_task = tokio::spawn(read_loop(
            read_half,
            reader_state,
            nick.to_string(),
            events,
        ));
        let writer_task = tokio::spawn(write_loop(
            write_half,
            writer_rx,
            config.keepalive_interval,
        ));

        Ok(Self {
            jid,
            nick: nick.to_string(),
            writer_tx,
            tasks: Mutex::new(vec![reader_task, writer_task]),
        })
    }

    /// Bound full JID.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Queues a stanza for sending.
    pub async fn send_raw(&self, xml: String) -> Result<(), HeraldError> {
        self.writer_tx
            .send(xml)
            .await
            .map_err(|_| HeraldError::Xmpp("bot writer is gone".into()))
    }

    /// Closes the stream and stops both tasks.
    pub async fn close(&self) {
        let _ = self.writer_tx.send("</stream:stream>".to_string()).await;
        // Give the writer a moment to flush the goodbye.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut read_half: R,
    mut reader: StanzaReader,
    nick: String,
    events: mpsc::Sender<BotEvent>,
) {
    let mut chunk = [0u8; 4096];
    'outer: loop {
        loop {
            let event = match reader.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stream parse error");
                    break 'outer;
                }
            };
            match event {
                ReaderEvent::Node(node) => match node.local_name() {
                    "message" => {
                        let stanza = MessageStanza::from_node(&node);
                        if is_loopback(&stanza, &nick) {
                            continue;
                        }
                        if !matches!(stanza.kind.as_str(), "chat" | "groupchat" | "normal") {
                            debug!(kind = %stanza.kind, "ignoring non-chat message");
                            continue;
                        }
                        if events.send(BotEvent::Message(stanza)).await.is_err() {
                            break 'outer;
                        }
                    }
                    "presence" => {
                        let stanza = PresenceStanza::from_node(&node);
                        if events.send(BotEvent::Presence(stanza)).await.is_err() {
                            break 'outer;
                        }
                    }
                    other => debug!(name = other, "ignoring stanza"),
                },
                ReaderEvent::StreamOpen(_) => {}
                ReaderEvent::StreamClose => {
                    debug!("server closed the stream");
                    break 'outer;
                }
            }
        }
        match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => reader.push(&chunk[..read]),
            Err(e) => {
                debug!(error = %e, "read error");
                break;
            }
        }
    }
    let _ = events.send(BotEvent::Disconnected).await;
}

/// Group messages echoed back with our own nick.
fn is_loopback(stanza: &MessageStanza, nick: &str) -> bool {
    stanza.kind == "groupchat"
        && stanza
            .from
            .as_ref()
            .and_then(Jid::resource)
            .map(|resource| resource == nick)
            .unwrap_or(false)
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut write_half: W,
    mut rx: mpsc::Receiver<String>,
    keepalive: Duration,
) {
    loop {
        let payload = select! {
            outbound = rx.recv() => match outbound {
                Some(xml) => xml,
                None => break,
            },
            _ = tokio::time::sleep(keepalive) => " ".to_string(),
        };
        if let Err(e) = write_half.write_all(payload.as_bytes()).await {
            debug!(error = %e, "write error");
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
}

/// In-memory "server" used by the bot and transport tests.
#[cfg(test)]
pub(crate) mod testsupport {
    use super::*;
    use crate::stanza::XmlNode;
    use tokio::io::DuplexStream;

    /// Server half: negotiates, then hands back the raw pipe plus the
    /// parser state for direct stanza exchange.
    pub(crate) async fn accept_bot(mut io: DuplexStream) -> (DuplexStream, StanzaReader) {
        let mut reader = StanzaReader::new();
        let mut chunk = [0u8; 4096];
        let mut stage = 0;
        loop {
            let read = io.read(&mut chunk).await.unwrap();
            assert!(read > 0, "client hung up during negotiation");
            reader.push(&chunk[..read]);
            while let Some(event) = reader.next_event().unwrap() {
                match (stage, event) {
                    (0, ReaderEvent::StreamOpen(_)) => {
                        io.write_all(
                            b"<stream:stream xmlns='jabber:client' id='s1'>\
                              <stream:features/>",
                        )
                        .await
                        .unwrap();
                        stage = 1;
                    }
                    (1, ReaderEvent::Node(node)) if node.local_name() == "auth" => {
                        io.write_all(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
                            .await
                            .unwrap();
                        reader.expect_stream_restart();
                        stage = 2;
                    }
                    (2, ReaderEvent::StreamOpen(_)) => {
                        io.write_all(
                            b"<stream:stream xmlns='jabber:client' id='s2'>\
                              <stream:features/>",
                        )
                        .await
                        .unwrap();
                        stage = 3;
                    }
                    (3, ReaderEvent::Node(node)) if node.local_name() == "iq" => {
                        io.write_all(
                            b"<iq type='result' id='bind-1'>\
                              <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                              <jid>bot@chat.example/uid-1</jid></bind></iq>",
                        )
                        .await
                        .unwrap();
                        stage = 4;
                    }
                    (4, ReaderEvent::Node(node)) if node.local_name() == "presence" => {
                        return (io, reader);
                    }
                    _ => {}
                }
            }
        }
    }

    pub(crate) async fn next_node(
        io: &mut DuplexStream,
        reader: &mut StanzaReader,
    ) -> XmlNode {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(ReaderEvent::Node(node)) = reader.next_event().unwrap() {
                return node;
            }
            let read = io.read(&mut chunk).await.unwrap();
            assert!(read > 0, "client hung up");
            reader.push(&chunk[..read]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testsupport::{accept_bot, next_node};
    use super::*;
    use tokio::io::duplex;

    fn bot_config() -> BotConfig {
        BotConfig {
            domain: "chat.example".to_string(),
            jid: None,
            password: None,
            keepalive_interval: Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn bot_connects_and_sends_stanzas() {
        let (client_io, server_io) = duplex(16 * 1024);
        let server = tokio::spawn(accept_bot(server_io));

        let (events_tx, _events_rx) = mpsc::channel(16);
        let bot = HeraldBot::from_io(client_io, bot_config(), "uid-1", events_tx)
            .await
            .unwrap();
        assert_eq!(bot.jid().full(), "bot@chat.example/uid-1");

        let (mut server_io, mut server_reader) = server.await.unwrap();
        let mut stanza = MessageStanza::chat(Jid::parse("peer@chat.example/uid-2").unwrap());
        stanza.subject = Some("example/hello".to_string());
        stanza.body = Some("{}".to_string());
        stanza.thread = Some("m-1".to_string());
        bot.send_raw(stanza.to_xml()).await.unwrap();

        let node = next_node(&mut server_io, &mut server_reader).await;
        assert_eq!(node.local_name(), "message");
        assert_eq!(node.attr("to"), Some("peer@chat.example/uid-2"));
        assert_eq!(node.child_text("thread"), Some("m-1"));

        bot.close().await;
    }

    #[tokio::test]
    async fn inbound_messages_become_events() {
        let (client_io, server_io) = duplex(16 * 1024);
        let server = tokio::spawn(accept_bot(server_io));

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let bot = HeraldBot::from_io(client_io, bot_config(), "uid-1", events_tx)
            .await
            .unwrap();
        let (mut server_io, _) = server.await.unwrap();

        server_io
            .write_all(
                b"<message from='peer@chat.example/uid-2' type='chat'>\
                  <subject>example/hello</subject><body>{}</body>\
                  <thread>m-9</thread></message>",
            )
            .await
            .unwrap();

        match events_rx.recv().await {
            Some(BotEvent::Message(stanza)) => {
                assert_eq!(stanza.subject.as_deref(), Some("example/hello"));
                assert_eq!(stanza.thread.as_deref(), Some("m-9"));
            }
            other => panic!("expected a message event, got {other:?}"),
        }

        bot.close().await;
    }

    #[tokio::test]
    async fn own_groupchat_echo_is_filtered() {
        let (client_io, server_io) = duplex(16 * 1024);
        let server = tokio::spawn(accept_bot(server_io));

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let bot = HeraldBot::from_io(client_io, bot_config(), "uid-1", events_tx)
            .await
            .unwrap();
        let (mut server_io, _) = server.await.unwrap();

        // Echo of our own group message, then a real one.
        server_io
            .write_all(
                b"<message from='demo@conference.x/uid-1' type='groupchat'>\
                  <subject>s</subject><body>echo</body></message>\
                  <message from='demo@conference.x/uid-2' type='groupchat'>\
                  <subject>s</subject><body>real</body></message>",
            )
            .await
            .unwrap();

        match events_rx.recv().await {
            Some(BotEvent::Message(stanza)) => {
                assert_eq!(stanza.body.as_deref(), Some("real"));
            }
            other => panic!("expected the non-loopback message, got {other:?}"),
        }

        bot.close().await;
    }

    #[tokio::test]
    async fn connection_loss_emits_disconnected() {
        let (client_io, server_io) = duplex(16 * 1024);
        let server = tokio::spawn(accept_bot(server_io));

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let bot = HeraldBot::from_io(client_io, bot_config(), "uid-1", events_tx)
            .await
            .unwrap();
        let (server_io, _) = server.await.unwrap();
        drop(server_io);

        match events_rx.recv().await {
            Some(BotEvent::Disconnected) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
        bot.close().await;
    }
}
