//! Stanza model and XML codec.
//!
//! Inbound bytes accumulate in a [`StanzaReader`] that cuts complete
//! depth-1 elements out of the stream and parses them into small DOM
//! nodes. Outbound stanzas are formatted by hand, with proper escaping.

use std::borrow::Cow;
use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use herald_core::HeraldError;

/// Upper bound of the inbound buffer; a stream that cannot produce one
/// complete stanza below this size is broken.
const MAX_STANZA_BYTES: usize = 256 * 1024;

pub const NS_MUC: &str = "http://jabber.org/protocol/muc";
pub const NS_MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub const NS_MUC_OWNER: &str = "http://jabber.org/protocol/muc#owner";
pub const NS_DELAY: &str = "urn:xmpp:delay";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_DATA_FORMS: &str = "jabber:x:data";

/// A bare or full JID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub local: Option<String>,
    pub domain: String,
    pub resource: Option<String>,
}

impl Jid {
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: Some(local.into()),
            domain: domain.into(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn parse(text: &str) -> Result<Self, HeraldError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(HeraldError::Xmpp("empty JID".into()));
        }
        let (bare, resource) = match text.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource.to_string())),
            None => (text, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local.to_string()), domain.to_string()),
            None => (None, bare.to_string()),
        };
        if domain.is_empty() {
            return Err(HeraldError::Xmpp(format!("JID without domain: {text}")));
        }
        Ok(Self {
            local,
            domain,
            resource,
        })
    }

    pub fn bare(&self) -> String {
        match &self.local {
            Some(local) => format!("{local}@{}", self.domain),
            None => self.domain.clone(),
        }
    }

    pub fn full(&self) -> String {
        match &self.resource {
            Some(resource) => format!("{}/{resource}", self.bare()),
            None => self.bare(),
        }
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full())
    }
}

/// A parsed XML element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: String,
}

impl XmlNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Element name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn child(&self, local: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    pub fn child_ns(&self, local: &str, xmlns: &str) -> Option<&XmlNode> {
        self.children
            .iter()
            .find(|c| c.local_name() == local && c.attr("xmlns") == Some(xmlns))
    }

    pub fn child_text(&self, local: &str) -> Option<&str> {
        self.child(local).map(|c| c.text.as_str())
    }
}

/// One event cut out of the inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    /// The `<stream:stream>` opening tag (attributes only).
    StreamOpen(XmlNode),
    /// A complete depth-1 element.
    Node(XmlNode),
    /// The `</stream:stream>` closing tag.
    StreamClose,
}

/// Incremental stream parser.
///
/// Bytes are pushed as they arrive; [`next_event`] re-scans the buffer and
/// returns `None` while no complete element is available yet.
///
/// [`next_event`]: StanzaReader::next_event
#[derive(Default)]
pub struct StanzaReader {
    buf: Vec<u8>,
    stream_opened: bool,
}

impl StanzaReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Arms the parser for a fresh `<stream:stream>` header, as mandated
    /// after a successful SASL exchange.
    pub fn expect_stream_restart(&mut self) {
        self.stream_opened = false;
    }

    pub fn next_event(&mut self) -> Result<Option<ReaderEvent>, HeraldError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        // A closing tag at depth 1 can only be `</stream:stream>`; the XML
        // parser would reject it as unmatched, so it is cut out by hand.
        let lead = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        if self.buf[lead..].starts_with(b"</") {
            return match self.buf[lead..].iter().position(|&b| b == b'>') {
                Some(end) => {
                    self.buf.drain(..lead + end + 1);
                    Ok(Some(ReaderEvent::StreamClose))
                }
                None => Ok(None),
            };
        }
        let mut reader = Reader::from_reader(self.buf.as_slice());
        let mut scratch = Vec::new();
        let mut stack: Vec<XmlNode> = Vec::new();
        // Offset of parsed-but-ignorable prefix (declarations, whitespace).
        let mut ignorable_end = 0usize;

        loop {
            let event = match reader.read_event_into(&mut scratch) {
                Ok(event) => event,
                // Truncated input: wait for more bytes, unless the buffer
                // already exceeds any reasonable stanza size.
                Err(_) if self.buf.len() < MAX_STANZA_BYTES => {
                    self.buf.drain(..ignorable_end);
                    return Ok(None);
                }
                Err(e) => {
                    return Err(HeraldError::Xmpp(format!("broken XML stream: {e}")));
                }
            };
            match event {
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {
                    if stack.is_empty() {
                        ignorable_end = reader.buffer_position();
                    }
                }
                Event::Start(start) => {
                    let node = node_from_start(&start);
                    if !self.stream_opened && stack.is_empty() {
                        self.stream_opened = true;
                        let consumed = reader.buffer_position();
                        self.buf.drain(..consumed);
                        return Ok(Some(ReaderEvent::StreamOpen(node)));
                    }
                    stack.push(node);
                }
                Event::Empty(start) => {
                    let node = node_from_start(&start);
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => {
                            let consumed = reader.buffer_position();
                            self.buf.drain(..consumed);
                            return Ok(Some(ReaderEvent::Node(node)));
                        }
                    }
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        let decoded = text
                            .unescape()
                            .map(Cow::into_owned)
                            .unwrap_or_else(|_| String::from_utf8_lossy(&text).into_owned());
                        top.text.push_str(&decoded);
                    } else {
                        ignorable_end = reader.buffer_position();
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::End(_) => match stack.pop() {
                    Some(node) => {
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        } else {
                            let consumed = reader.buffer_position();
                            self.buf.drain(..consumed);
                            return Ok(Some(ReaderEvent::Node(node)));
                        }
                    }
                    None => {
                        // Closing tag at depth 0: the peer ends the stream.
                        let consumed = reader.buffer_position();
                        self.buf.drain(..consumed);
                        return Ok(Some(ReaderEvent::StreamClose));
                    }
                },
                Event::Eof => {
                    self.buf.drain(..ignorable_end);
                    return Ok(None);
                }
            }
        }
    }
}

fn node_from_start(start: &quick_xml::events::BytesStart<'_>) -> XmlNode {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let attrs = start
        .attributes()
        .flatten()
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map(Cow::into_owned)
                .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
            (key, value)
        })
        .collect();
    XmlNode {
        name,
        attrs,
        children: Vec::new(),
        text: String::new(),
    }
}

/// A `<message>` stanza, reduced to the fields Herald uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageStanza {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    /// `chat`, `groupchat` or `normal`.
    pub kind: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub thread: Option<String>,
    pub parent_thread: Option<String>,
    /// Stamped by the server as historical delivery: to be ignored.
    pub delayed: bool,
}

impl MessageStanza {
    pub fn chat(to: Jid) -> Self {
        Self {
            to: Some(to),
            kind: "chat".to_string(),
            ..Default::default()
        }
    }

    pub fn groupchat(to: Jid) -> Self {
        Self {
            to: Some(to),
            kind: "groupchat".to_string(),
            ..Default::default()
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<message");
        if let Some(to) = &self.to {
            push_attr(&mut xml, "to", &to.full());
        }
        if !self.kind.is_empty() {
            push_attr(&mut xml, "type", &self.kind);
        }
        xml.push('>');
        if let Some(subject) = &self.subject {
            xml.push_str("<subject>");
            xml.push_str(&escape(subject));
            xml.push_str("</subject>");
        }
        if let Some(body) = &self.body {
            xml.push_str("<body>");
            xml.push_str(&escape(body));
            xml.push_str("</body>");
        }
        if let Some(thread) = &self.thread {
            xml.push_str("<thread");
            if let Some(parent) = &self.parent_thread {
                push_attr(&mut xml, "parent", parent);
            }
            xml.push('>');
            xml.push_str(&escape(thread));
            xml.push_str("</thread>");
        }
        xml.push_str("</message>");
        xml
    }

    pub fn from_node(node: &XmlNode) -> Self {
        let thread_node = node.child("thread");
        Self {
            from: node.attr("from").and_then(|j| Jid::parse(j).ok()),
            to: node.attr("to").and_then(|j| Jid::parse(j).ok()),
            kind: node.attr("type").unwrap_or("normal").to_string(),
            subject: node
                .child_text("subject")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            body: node.child_text("body").map(str::to_string),
            thread: thread_node
                .map(|t| t.text.clone())
                .filter(|t| !t.is_empty()),
            parent_thread: thread_node
                .and_then(|t| t.attr("parent"))
                .map(str::to_string),
            delayed: node.child_ns("delay", NS_DELAY).is_some(),
        }
    }
}

/// A `<presence>` stanza.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceStanza {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    /// `None` means available.
    pub kind: Option<String>,
    /// MUC affiliation, when the presence comes from a room.
    pub affiliation: Option<String>,
    /// First condition child of an error presence.
    pub error_condition: Option<String>,
}

impl PresenceStanza {
    /// The presence that joins (or creates) a MUC room.
    pub fn muc_join(room: &Jid, nick: &str) -> String {
        let to = room.clone().with_resource(nick);
        let mut xml = String::from("<presence");
        push_attr(&mut xml, "to", &to.full());
        xml.push_str("><x xmlns='");
        xml.push_str(NS_MUC);
        xml.push_str("'/></presence>");
        xml
    }

    pub fn from_node(node: &XmlNode) -> Self {
        let muc_item = node
            .child_ns("x", NS_MUC_USER)
            .and_then(|x| x.child("item"));
        Self {
            from: node.attr("from").and_then(|j| Jid::parse(j).ok()),
            to: node.attr("to").and_then(|j| Jid::parse(j).ok()),
            kind: node.attr("type").map(str::to_string),
            affiliation: muc_item
                .and_then(|item| item.attr("affiliation"))
                .map(str::to_string),
            error_condition: node
                .child("error")
                .and_then(|error| error.children.first())
                .map(|condition| condition.local_name().to_string()),
        }
    }
}

fn push_attr(xml: &mut String, name: &str, value: &str) {
    xml.push(' ');
    xml.push_str(name);
    xml.push_str("='");
    xml.push_str(&escape(value));
    xml.push('\'');
}
