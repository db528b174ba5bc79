//! Stanza model: `iq`, `message` and `presence`.
//!
//! All three kinds share the addressing header (`to`, `from`, `id`,
//! `xml:lang`) and carry opaque child elements as payload.

use std::fmt;

use crate::error::{Result, XmppError};
use crate::jid::Jid;
use crate::stream::StanzaTree;
use crate::xml::Element;

/// Root element name to stanza kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
}

impl StanzaKind {
    pub fn classify(local_name: &str) -> Option<Self> {
        match local_name {
            "iq" => Some(Self::Iq),
            "message" => Some(Self::Message),
            "presence" => Some(Self::Presence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }

    /// `get` and `set` expect a reply; `result` and `error` are replies.
    pub fn is_request(self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

impl fmt::Display for IqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes shared by every stanza kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub id: Option<String>,
    pub language: Option<String>,
}

impl Header {
    fn read(el: &Element) -> Result<Self> {
        let jid = |key: &str| -> Result<Option<Jid>> {
            match el.attr(key).filter(|v| !v.is_empty()) {
                Some(v) => v
                    .parse()
                    .map(Some)
                    .map_err(|_| XmppError::Protocol(format!("invalid '{}' address: {}", key, v))),
                None => Ok(None),
            }
        };
        let text = |key: &str| el.attr(key).filter(|v| !v.is_empty()).map(str::to_string);
        Ok(Self {
            to: jid("to")?,
            from: jid("from")?,
            id: text("id"),
            language: text("xml:lang"),
        })
    }

    fn write(&self, el: &mut Element) {
        el.set_opt_attr("to", self.to.as_ref().map(Jid::to_string));
        el.set_opt_attr("from", self.from.as_ref().map(Jid::to_string));
        el.set_opt_attr("id", self.id.clone());
        el.set_opt_attr("xml:lang", self.language.clone());
    }
}

/// Request/response unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
    pub iq_type: IqType,
    pub header: Header,
    pub payload: Option<Element>,
    /// The `<error/>` child of an error reply.
    pub error: Option<Element>,
}

impl Iq {
    pub fn new(iq_type: IqType, payload: Option<Element>) -> Self {
        Self {
            iq_type,
            header: Header::default(),
            payload,
            error: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.header.id.as_deref()
    }

    pub fn is_request(&self) -> bool {
        self.iq_type.is_request()
    }

    /// Defined condition of an error reply, e.g. `item-not-found`.
    pub fn error_condition(&self) -> Option<&str> {
        self.error
            .as_ref()?
            .children()
            .find(|c| c.local_name() != "text")
            .map(Element::local_name)
    }
}

/// Notification unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub message_type: Option<String>,
    pub header: Header,
    pub payload: Vec<Element>,
}

impl Message {
    /// A `chat` message with a plain-text body.
    pub fn chat(to: Jid, body: &str) -> Self {
        Self {
            message_type: Some("chat".to_string()),
            header: Header {
                to: Some(to),
                ..Header::default()
            },
            payload: vec![Element::new("body").with_text(body)],
        }
    }

    pub fn body(&self) -> Option<String> {
        self.payload
            .iter()
            .find(|e| e.local_name() == "body")
            .map(Element::text)
    }
}

/// Status unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub presence_type: Option<String>,
    pub header: Header,
    pub payload: Vec<Element>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    Iq(Iq),
    Message(Message),
    Presence(Presence),
}

impl Stanza {
    pub fn parse(tree: &StanzaTree) -> Result<Stanza> {
        Stanza::from_element(Element::parse(&tree.xml)?)
    }

    pub fn from_element(el: Element) -> Result<Stanza> {
        let kind = StanzaKind::classify(el.local_name())
            .ok_or_else(|| XmppError::Protocol(format!("not a stanza: <{}>", el.name())))?;
        let header = Header::read(&el)?;
        let kind_attr = el.attr("type").map(str::to_string);

        Ok(match kind {
            StanzaKind::Iq => {
                let iq_type = kind_attr
                    .as_deref()
                    .and_then(IqType::parse)
                    .ok_or_else(|| XmppError::Protocol("iq without a valid type".to_string()))?;
                Stanza::Iq(Iq {
                    iq_type,
                    header,
                    payload: el.children().find(|c| c.local_name() != "error").cloned(),
                    error: el.child("error").cloned(),
                })
            }
            StanzaKind::Message => Stanza::Message(Message {
                message_type: kind_attr,
                header,
                payload: el.children().cloned().collect(),
            }),
            StanzaKind::Presence => Stanza::Presence(Presence {
                presence_type: kind_attr,
                header,
                payload: el.children().cloned().collect(),
            }),
        })
    }

    pub fn kind(&self) -> StanzaKind {
        match self {
            Stanza::Iq(_) => StanzaKind::Iq,
            Stanza::Message(_) => StanzaKind::Message,
            Stanza::Presence(_) => StanzaKind::Presence,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Stanza::Iq(iq) => &iq.header,
            Stanza::Message(m) => &m.header,
            Stanza::Presence(p) => &p.header,
        }
    }

    pub fn to_element(&self) -> Element {
        let (name, kind_attr, payload): (&str, Option<&str>, Vec<&Element>) = match self {
            Stanza::Iq(iq) => (
                "iq",
                Some(iq.iq_type.as_str()),
                iq.payload.iter().chain(iq.error.iter()).collect(),
            ),
            Stanza::Message(m) => ("message", m.message_type.as_deref(), m.payload.iter().collect()),
            Stanza::Presence(p) => ("presence", p.presence_type.as_deref(), p.payload.iter().collect()),
        };
        let mut el = Element::new(name);
        el.set_opt_attr("type", kind_attr);
        self.header().write(&mut el);
        for child in payload {
            el.push_child(child.clone());
        }
        el
    }

    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

impl From<Message> for Stanza {
    fn from(m: Message) -> Self {
        Stanza::Message(m)
    }
}

impl From<Presence> for Stanza {
    fn from(p: Presence) -> Self {
        Stanza::Presence(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(name: &str, xml: &str) -> StanzaTree {
        StanzaTree {
            name: name.to_string(),
            xml: xml.to_string(),
        }
    }

    #[test]
    fn test_parse_iq_result_with_bind() {
        let stanza = Stanza::parse(&tree(
            "iq",
            "<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@example.com/resource</jid></bind></iq>",
        ))
        .unwrap();
        let Stanza::Iq(iq) = stanza else {
            panic!("expected iq");
        };
        assert_eq!(iq.iq_type, IqType::Result);
        assert_eq!(iq.id(), Some("bind_1"));
        assert!(!iq.is_request());
        let bind = iq.payload.unwrap();
        assert_eq!(bind.child("jid").unwrap().text(), "user@example.com/resource");
    }

    #[test]
    fn test_parse_message_header() {
        let stanza = Stanza::parse(&tree(
            "message",
            "<message from='alice@example.com/res' to='bob@example.com' type='chat' xml:lang='en' id='m1'><body>Hello</body><active xmlns='http://jabber.org/protocol/chatstates'/></message>",
        ))
        .unwrap();
        assert_eq!(stanza.kind(), StanzaKind::Message);
        let header = stanza.header();
        assert_eq!(header.from.as_ref().unwrap().resource(), Some("res"));
        assert_eq!(header.language.as_deref(), Some("en"));
        let Stanza::Message(m) = stanza else { unreachable!() };
        assert_eq!(m.body().as_deref(), Some("Hello"));
        assert_eq!(m.payload.len(), 2);
    }

    #[test]
    fn test_error_reply_condition() {
        let stanza = Stanza::parse(&tree(
            "iq",
            "<iq type='error' id='5'><query xmlns='jabber:iq:roster'/><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        ))
        .unwrap();
        let Stanza::Iq(iq) = stanza else { unreachable!() };
        assert_eq!(iq.payload.as_ref().unwrap().local_name(), "query");
        assert_eq!(iq.error_condition(), Some("item-not-found"));
    }

    #[test]
    fn test_iq_without_type_is_rejected() {
        let err = Stanza::parse(&tree("iq", "<iq id='1'/>")).unwrap_err();
        assert!(matches!(err, XmppError::Protocol(_)));
    }

    #[test]
    fn test_non_stanza_root_is_rejected() {
        assert!(Stanza::parse(&tree("r", "<r xmlns='urn:xmpp:sm:3'/>")).is_err());
    }

    #[test]
    fn test_serialize_iq_request() {
        let mut iq = Iq::new(IqType::Get, Some(Element::new("ping").with_ns("urn:xmpp:ping")));
        iq.header.to = Some("example.com".parse().unwrap());
        iq.header.id = Some("7".to_string());
        assert_eq!(
            Stanza::from(iq).to_xml(),
            "<iq type='get' to='example.com' id='7'><ping xmlns='urn:xmpp:ping'/></iq>"
        );
    }

    #[test]
    fn test_chat_message_serializes_body() {
        let m = Message::chat("bob@example.com".parse().unwrap(), "hi & bye");
        assert_eq!(
            Stanza::from(m).to_xml(),
            "<message type='chat' to='bob@example.com'><body>hi &amp; bye</body></message>"
        );
    }
}
