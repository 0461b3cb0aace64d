//! XMPP stream negotiation: open, SASL, resource binding.
//!
//! Generic over the socket so tests can drive it through an in-memory
//! duplex pipe. TLS is not part of the stream: transport security belongs
//! to the deployment.

use base64::{engine::general_purpose, Engine as _};
use quick_xml::escape::escape;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use herald_core::HeraldError;

use crate::stanza::{Jid, ReaderEvent, StanzaReader, XmlNode, NS_BIND, NS_SASL};

pub struct StreamConfig {
    /// XMPP domain of the server.
    pub domain: String,
    /// Account JID; `None` binds anonymously.
    pub jid: Option<Jid>,
    pub password: Option<String>,
    /// Resource to bind, set to the local peer uid.
    pub resource: String,
}

pub struct XmppStream<S> {
    io: S,
    reader: StanzaReader,
}

impl<S: AsyncRead + AsyncWrite + Unpin> XmppStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            reader: StanzaReader::new(),
        }
    }

    /// Runs the whole client-side negotiation and returns the bound JID.
    pub async fn negotiate(&mut self, config: &StreamConfig) -> Result<Jid, HeraldError> {
        self.open(&config.domain).await?;
        self.authenticate(config).await?;
        // SASL success resets the stream.
        self.open(&config.domain).await?;
        self.bind(&config.resource).await
    }

    pub async fn write_raw(&mut self, xml: &str) -> Result<(), HeraldError> {
        self.io.write_all(xml.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Hands the socket and the partially-filled parser to the caller.
    pub fn into_parts(self) -> (S, StanzaReader) {
        (self.io, self.reader)
    }

    async fn next_event(&mut self) -> Result<ReaderEvent, HeraldError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(event) = self.reader.next_event()? {
                return Ok(event);
            }
            let read = self.io.read(&mut chunk).await?;
            if read == 0 {
                return Err(HeraldError::Xmpp(
                    "connection closed during negotiation".into(),
                ));
            }
            self.reader.push(&chunk[..read]);
        }
    }

    async fn next_node(&mut self) -> Result<XmlNode, HeraldError> {
        loop {
            match self.next_event().await? {
                ReaderEvent::Node(node) => return Ok(node),
                ReaderEvent::StreamOpen(_) => continue,
                ReaderEvent::StreamClose => {
                    return Err(HeraldError::Xmpp("server closed the stream".into()))
                }
            }
        }
    }

    /// Sends the stream header and reads up to the server features.
    async fn open(&mut self, domain: &str) -> Result<XmlNode, HeraldError> {
        self.reader.expect_stream_restart();
        let header = format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' \
             xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
            escape(domain)
        );
        self.write_raw(&header).await?;

        loop {
            match self.next_event().await? {
                ReaderEvent::StreamOpen(open) => {
                    debug!(id = open.attr("id").unwrap_or(""), "stream opened");
                }
                ReaderEvent::Node(node) if node.local_name() == "features" => {
                    return Ok(node);
                }
                ReaderEvent::Node(node) if node.local_name() == "error" => {
                    return Err(HeraldError::Xmpp(format!(
                        "stream error: {}",
                        node.children
                            .first()
                            .map(XmlNode::local_name)
                            .unwrap_or("unknown")
                    )));
                }
                ReaderEvent::Node(node) => {
                    debug!(name = %node.name, "ignoring pre-feature node");
                }
                ReaderEvent::StreamClose => {
                    return Err(HeraldError::Xmpp("server closed the stream".into()))
                }
            }
        }
    }

    async fn authenticate(&mut self, config: &StreamConfig) -> Result<(), HeraldError> {
        let (mechanism, payload) = match (&config.jid, &config.password) {
            (Some(jid), Some(password)) => {
                let local = jid.local.clone().unwrap_or_default();
                let token = format!("\0{local}\0{password}");
                (
                    "PLAIN",
                    general_purpose::STANDARD.encode(token.as_bytes()),
                )
            }
            _ => ("ANONYMOUS", String::from("=")),
        };
        let auth =
            format!("<auth xmlns='{NS_SASL}' mechanism='{mechanism}'>{payload}</auth>");
        self.write_raw(&auth).await?;

        let node = self.next_node().await?;
        match node.local_name() {
            "success" => Ok(()),
            "failure" => Err(HeraldError::Xmpp(format!(
                "authentication failed: {}",
                node.children
                    .first()
                    .map(XmlNode::local_name)
                    .unwrap_or("unknown")
            ))),
            other => Err(HeraldError::Xmpp(format!(
                "unexpected SASL answer: {other}"
            ))),
        }
    }

    /// Binds the resource; the server answers with the effective full JID.
    async fn bind(&mut self, resource: &str) -> Result<Jid, HeraldError> {
        let iq = format!(
            "<iq type='set' id='bind-1'><bind xmlns='{NS_BIND}'>\
             <resource>{}</resource></bind></iq>",
            escape(resource)
        );
        self.write_raw(&iq).await?;

        let node = self.next_node().await?;
        if node.local_name() != "iq" || node.attr("type") != Some("result") {
            return Err(HeraldError::Xmpp(format!(
                "resource binding refused: {}",
                node.name
            )));
        }
        let jid_text = node
            .child("bind")
            .and_then(|bind| bind.child_text("jid"))
            .ok_or_else(|| HeraldError::Xmpp("bind result without a JID".into()))?;
        Jid::parse(jid_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Plays the server side of a successful anonymous negotiation.
    async fn fake_server(mut io: tokio::io::DuplexStream) {
        let mut reader = StanzaReader::new();
        let mut chunk = [0u8; 4096];
        let mut stage = 0;
        loop {
            let read = match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(read) => read,
            };
            reader.push(&chunk[..read]);
            while let Ok(Some(event)) = reader.next_event() {
                match (stage, event) {
                    (0, ReaderEvent::StreamOpen(_)) => {
                        io.write_all(
                            b"<stream:stream xmlns='jabber:client' id='s1'>\
                              <stream:features><mechanisms \
                              xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                              <mechanism>ANONYMOUS</mechanism>\
                              </mechanisms></stream:features>",
                        )
                        .await
                        .unwrap();
                        stage = 1;
                    }
                    (1, ReaderEvent::Node(node)) if node.local_name() == "auth" => {
                        io.write_all(
                            b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>",
                        )
                        .await
                        .unwrap();
                        // The client restarts the stream now.
                        reader.expect_stream_restart();
                        stage = 2;
                    }
                    (2, ReaderEvent::StreamOpen(_)) => {
                        io.write_all(
                            b"<stream:stream xmlns='jabber:client' id='s2'>\
                              <stream:features><bind \
                              xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
                              </stream:features>",
                        )
                        .await
                        .unwrap();
                        stage = 3;
                    }
                    (3, ReaderEvent::Node(node)) if node.local_name() == "iq" => {
                        io.write_all(
                            b"<iq type='result' id='bind-1'>\
                              <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                              <jid>anon-1@chat.example/uid-1</jid></bind></iq>",
                        )
                        .await
                        .unwrap();
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    #[tokio::test]
    async fn anonymous_negotiation_binds_the_resource() {
        let (client_io, server_io) = duplex(16 * 1024);
        let server = tokio::spawn(fake_server(server_io));

        let mut stream = XmppStream::new(client_io);
        let jid = stream
            .negotiate(&StreamConfig {
                domain: "chat.example".to_string(),
                jid: None,
                password: None,
                resource: "uid-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(jid.full(), "anon-1@chat.example/uid-1");

        server.await.unwrap();
    }
}
