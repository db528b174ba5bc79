//! Minimal XML element tree for stanzas.
//!
//! Parses a complete element (as produced by the stream tokenizer) with
//! quick-xml and serializes elements back to wire form. Names are kept
//! qualified as written; namespaces are plain `xmlns` attributes, which is
//! all XMPP stanza handling needs.

use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Result, XmppError};
use crate::stream::local_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

fn invalid(e: impl fmt::Display) -> XmppError {
    XmppError::InvalidXml(e.to_string())
}

fn start_element(start: &BytesStart<'_>) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(invalid)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(invalid)?.into_owned();
        element.attrs.push((key, value));
    }
    Ok(element)
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a single complete element.
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        loop {
            let finished = match reader.read_event().map_err(invalid)? {
                Event::Start(e) => {
                    stack.push(start_element(&e)?);
                    None
                }
                Event::Empty(e) => Some(start_element(&e)?),
                Event::End(_) => Some(stack.pop().ok_or_else(|| invalid("unbalanced end tag"))?),
                Event::Text(t) => {
                    if let Some(top) = stack.last_mut() {
                        top.push_text(t.unescape().map_err(invalid)?);
                    }
                    None
                }
                Event::CData(c) => {
                    if let Some(top) = stack.last_mut() {
                        top.push_text(String::from_utf8_lossy(&c));
                    }
                    None
                }
                Event::Eof => return Err(invalid("document ended before the root element closed")),
                _ => None,
            };

            if let Some(element) = finished {
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(element)),
                    None => return Ok(element),
                }
            }
        }
    }

    fn push_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        match self.children.last_mut() {
            Some(Node::Text(prev)) => prev.push_str(&text),
            _ => self.children.push(Node::Text(text)),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_ns(self, ns: &str) -> Self {
        self.with_attr("xmlns", ns)
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Set or remove an attribute depending on `value`.
    pub fn set_opt_attr(&mut self, key: &str, value: Option<impl Into<String>>) {
        match value {
            Some(v) => self.set_attr(key, v),
            None => self.attrs.retain(|(k, _)| k != key),
        }
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_name(&self) -> &str {
        local_name(&self.name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value of the element's own `xmlns` attribute.
    pub fn namespace(&self) -> Option<&str> {
        self.attr("xmlns")
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child with the given local name.
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.children().find(|e| e.local_name() == local)
    }

    /// First child with the given local name and `xmlns`.
    pub fn child_ns(&self, local: &str, ns: &str) -> Option<&Element> {
        self.children()
            .find(|e| e.local_name() == local && e.namespace() == Some(ns))
    }

    /// Concatenated character data of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Serialize to wire form.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape(v.as_str()));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_to(out),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_features() {
        let xml = "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism></mechanisms></stream:features>";
        let el = Element::parse(xml).unwrap();
        assert_eq!(el.name(), "stream:features");
        assert_eq!(el.local_name(), "features");
        let tls = el.child_ns("starttls", "urn:ietf:params:xml:ns:xmpp-tls").unwrap();
        assert!(tls.child("required").is_some());
        let mechs: Vec<String> = el.child("mechanisms").unwrap().children().map(Element::text).collect();
        assert_eq!(mechs, ["PLAIN", "SCRAM-SHA-1"]);
    }

    #[test]
    fn test_entities_are_unescaped() {
        let el = Element::parse("<message to='a&amp;b@x'><body>1 &lt; 2 <![CDATA[<raw>]]></body></message>").unwrap();
        assert_eq!(el.attr("to"), Some("a&b@x"));
        assert_eq!(el.child("body").unwrap().text(), "1 < 2 <raw>");
    }

    #[test]
    fn test_serialize_escapes_and_self_closes() {
        let el = Element::new("iq")
            .with_attr("type", "get")
            .with_attr("to", "o'neil@example.com")
            .with_child(Element::new("ping").with_ns("urn:xmpp:ping"));
        assert_eq!(
            el.to_xml(),
            "<iq type='get' to='o&apos;neil@example.com'><ping xmlns='urn:xmpp:ping'/></iq>"
        );
        let reparsed = Element::parse(&el.to_xml()).unwrap();
        assert_eq!(reparsed, el);
    }

    #[test]
    fn test_set_opt_attr_removes() {
        let mut el = Element::new("presence").with_attr("to", "x@y");
        el.set_opt_attr("to", None::<String>);
        assert_eq!(el.attr("to"), None);
        assert_eq!(el.to_xml(), "<presence/>");
    }

    #[test]
    fn test_truncated_document_is_rejected() {
        assert!(matches!(Element::parse("<iq><query>"), Err(XmppError::InvalidXml(_))));
    }
}
