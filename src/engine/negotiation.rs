//! Stream negotiation: stream open, STARTTLS, SASL, binding and session.
//!
//! Runs on the transport directly, before the reader and dispatcher exist,
//! using a send-then-read-until-expected-element pattern. Every read is
//! bounded by the negotiation timeout.

use std::collections::VecDeque;
use std::time::Duration;

use quick_xml::escape::escape;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::features::{StreamFeatures, NS_BIND, NS_SASL, NS_SESSION, NS_TLS};
use crate::error::{Result, SaslError, TlsError, XmppError};
use crate::jid::Jid;
use crate::sasl::{self, Credentials};
use crate::stanza::{Iq, IqType, Stanza};
use crate::stream::{Frame, StanzaTree, StreamTokenizer};
use crate::transport::{Transport, READ_BUFFER_SIZE};
use crate::xml::Element;

/// Id of the resource binding request.
pub const BIND_ID: &str = "bind-0";
pub const SESSION_ID: &str = "session-0";

/// Condition carried by a `<stream:error/>`.
pub(crate) fn stream_error_condition(tree: &StanzaTree) -> String {
    Element::parse(&tree.xml)
        .ok()
        .and_then(|el| {
            el.children()
                .find(|c| c.local_name() != "text")
                .map(|c| c.local_name().to_string())
        })
        .unwrap_or_else(|| "undefined-condition".to_string())
}

pub(crate) fn is_stream_error(tree: &StanzaTree) -> bool {
    tree.name == "stream:error"
}

pub(crate) struct Negotiator {
    conn_id: u64,
    transport: Transport,
    tokenizer: StreamTokenizer,
    pending: VecDeque<Frame>,
    timeout: Duration,
    debug_stanzas: bool,
}

impl Negotiator {
    pub fn new(conn_id: u64, transport: Transport, timeout: Duration, debug_stanzas: bool) -> Self {
        Self {
            conn_id,
            transport,
            tokenizer: StreamTokenizer::new(),
            pending: VecDeque::new(),
            timeout,
            debug_stanzas,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    pub async fn send(&mut self, xml: &str) -> Result<()> {
        if self.debug_stanzas {
            debug!(target: "fluux_xmpp::wire", conn_id = self.conn_id, "SEND {}", xml);
        }
        self.transport.send(xml.as_bytes()).await
    }

    /// Write `xml`, then read until an element whose local name is in `expected`.
    pub async fn send_and_await(&mut self, xml: &str, expected: &[&str]) -> Result<Element> {
        self.send(xml).await?;
        self.await_element(expected).await
    }

    async fn await_element(&mut self, expected: &[&str]) -> Result<Element> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            while let Some(frame) = self.pending.pop_front() {
                match frame {
                    Frame::StreamOpen(_) => continue,
                    Frame::StreamClose => {
                        return Err(XmppError::Disconnected(
                            "server closed the stream during negotiation".to_string(),
                        ))
                    }
                    Frame::Element(tree) if is_stream_error(&tree) => {
                        return Err(XmppError::StreamError(stream_error_condition(&tree)));
                    }
                    Frame::Element(tree) => {
                        if self.debug_stanzas {
                            debug!(target: "fluux_xmpp::wire", conn_id = self.conn_id, "RECV {}", tree.xml);
                        }
                        if expected.contains(&tree.local_name()) {
                            return Element::parse(&tree.xml);
                        }
                        warn!(conn_id = self.conn_id, element = %tree.name, "Unexpected element during negotiation");
                    }
                }
            }

            let n = tokio::time::timeout_at(deadline, self.transport.receive(&mut buf))
                .await
                .map_err(|_| XmppError::Timeout)??;
            if n == 0 {
                return Err(XmppError::Disconnected(
                    "server closed the connection during negotiation".to_string(),
                ));
            }
            self.pending.extend(self.tokenizer.feed(&buf[..n]));
        }
    }

    /// Start a new stream and return the features the server offers on it.
    pub async fn open_stream(&mut self, to: &str, language: &str) -> Result<StreamFeatures> {
        let header = format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' xml:lang='{}'>",
            escape(to),
            escape(language)
        );
        let features = self.send_and_await(&header, &["features"]).await?;
        Ok(StreamFeatures::parse(&features))
    }

    /// Forget the old stream's parser state before a stream restart.
    pub fn restart(&mut self) {
        self.tokenizer.reset();
        self.pending.clear();
    }

    /// `<starttls/>`, `<proceed/>`, then the TLS handshake in place.
    pub async fn starttls(&mut self, validation_host: &str, insecure: bool) -> Result<()> {
        let starttls = Element::new("starttls").with_ns(NS_TLS).to_xml();
        let reply = self.send_and_await(&starttls, &["proceed", "failure"]).await?;
        if reply.local_name() != "proceed" {
            return Err(TlsError::ServerFailure.into());
        }

        let upgraded = tokio::time::timeout(
            self.timeout,
            self.transport.upgrade_to_encrypted(validation_host, insecure),
        )
        .await;
        match upgraded {
            Ok(Ok(())) => {
                info!(conn_id = self.conn_id, host = validation_host, "STARTTLS upgrade complete");
                self.restart();
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(conn_id = self.conn_id, error = %e, "STARTTLS upgrade failed");
                Err(TlsError::ValidationError.into())
            }
            Err(_) => {
                warn!(conn_id = self.conn_id, "STARTTLS handshake timed out");
                Err(TlsError::ValidationError.into())
            }
        }
    }

    /// Run the SASL exchange with the strongest mechanism both sides support.
    pub async fn authenticate(&mut self, features: &StreamFeatures, credentials: Credentials) -> Result<&'static str> {
        let name = sasl::select_mechanism(features.mechanisms.iter().map(String::as_str))?;
        let mut mechanism = sasl::create(name, credentials)?;
        info!(conn_id = self.conn_id, mechanism = name, "Starting SASL authentication");

        let initial = if mechanism.has_initial_response() {
            sasl::encode_payload(&mechanism.next_token(&[])?)
        } else {
            String::new()
        };
        let auth = Element::new("auth")
            .with_ns(NS_SASL)
            .with_attr("mechanism", name)
            .with_text(initial)
            .to_xml();

        let expected = ["challenge", "success", "failure"];
        let mut reply = self.send_and_await(&auth, &expected).await?;
        loop {
            match reply.local_name() {
                "challenge" => {
                    let challenge = sasl::decode_payload(&reply.text())?;
                    let response = mechanism.next_token(&challenge)?;
                    let xml = Element::new("response")
                        .with_ns(NS_SASL)
                        .with_text(sasl::encode_payload(&response))
                        .to_xml();
                    reply = self.send_and_await(&xml, &expected).await?;
                }
                "success" => {
                    // Additional data with success carries the server's final proof.
                    let data = sasl::decode_payload(&reply.text())?;
                    if !mechanism.is_complete() || !data.is_empty() {
                        if !mechanism.next_token(&data)?.is_empty() {
                            return Err(SaslError::ServerProofMismatch.into());
                        }
                    }
                    if !mechanism.is_complete() {
                        return Err(SaslError::ServerProofMismatch.into());
                    }
                    info!(conn_id = self.conn_id, mechanism = name, "SASL authentication succeeded");
                    return Ok(name);
                }
                _ => {
                    let condition = reply
                        .children()
                        .find(|c| c.local_name() != "text")
                        .map(|c| c.local_name().to_string())
                        .unwrap_or_else(|| "not-authorized".to_string());
                    warn!(conn_id = self.conn_id, mechanism = name, condition = %condition, "SASL authentication failed");
                    return Err(SaslError::Rejected(condition).into());
                }
            }
        }
    }

    /// Read until the reply to the negotiation `iq` with `id` arrives.
    async fn await_iq(&mut self, id: &str) -> Result<Iq> {
        loop {
            let el = self.await_element(&["iq"]).await?;
            match Stanza::from_element(el)? {
                Stanza::Iq(iq) if iq.id() == Some(id) && !iq.is_request() => return Ok(iq),
                other => debug!(conn_id = self.conn_id, kind = ?other.kind(), "Ignoring iq during negotiation"),
            }
        }
    }

    /// Bind a resource (server-assigned when `resource` is `None`).
    pub async fn bind(&mut self, resource: Option<&str>) -> Result<Jid> {
        let mut bind = Element::new("bind").with_ns(NS_BIND);
        if let Some(resource) = resource.filter(|r| !r.is_empty()) {
            bind.push_child(Element::new("resource").with_text(resource));
        }
        let mut iq = Iq::new(IqType::Set, Some(bind));
        iq.header.id = Some(BIND_ID.to_string());
        self.send(&Stanza::Iq(iq).to_xml()).await?;

        let reply = self.await_iq(BIND_ID).await?;
        if reply.iq_type == IqType::Error {
            return Err(XmppError::Protocol(format!(
                "resource binding failed: {}",
                reply.error_condition().unwrap_or("undefined-condition")
            )));
        }
        let jid = reply
            .payload
            .as_ref()
            .and_then(|p| p.child("jid"))
            .map(Element::text)
            .ok_or_else(|| XmppError::Protocol("erroneous bind response".to_string()))?;
        jid.parse()
    }

    /// Legacy RFC 3921 session establishment.
    pub async fn establish_session(&mut self) -> Result<()> {
        let mut iq = Iq::new(IqType::Set, Some(Element::new("session").with_ns(NS_SESSION)));
        iq.header.id = Some(SESSION_ID.to_string());
        self.send(&Stanza::Iq(iq).to_xml()).await?;

        let reply = self.await_iq(SESSION_ID).await?;
        if reply.iq_type == IqType::Error {
            return Err(XmppError::Protocol(format!(
                "session establishment failed: {}",
                reply.error_condition().unwrap_or("undefined-condition")
            )));
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Hand the negotiated stream over to the reader, with any frames already
    /// read but not yet consumed.
    pub fn into_parts(self) -> (Transport, StreamTokenizer, VecDeque<Frame>) {
        (self.transport, self.tokenizer, self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn negotiator() -> (Negotiator, DuplexStream) {
        let (client, server) = tokio::io::duplex(8192);
        let n = Negotiator::new(1, Transport::new(Box::new(client)), Duration::from_millis(500), false);
        (n, server)
    }

    #[tokio::test]
    async fn test_open_stream_reads_split_features() {
        let (mut n, mut server) = negotiator();
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let read = server.read(&mut buf).await.unwrap();
            let header = String::from_utf8_lossy(&buf[..read]).to_string();
            server
                .write_all(b"<?xml version='1.0'?><stream:stream from='example.com' id='s1' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'><stream:fea")
                .await
                .unwrap();
            server
                .write_all(b"tures><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>")
                .await
                .unwrap();
            (header, server)
        });

        let features = n.open_stream("example.com", "en").await.unwrap();
        assert!(features.tls_required());
        let (header, _server) = server_task.await.unwrap();
        assert!(header.contains("to='example.com'"));
        assert!(header.contains("xml:lang='en'"));
    }

    #[tokio::test]
    async fn test_stream_error_is_fatal() {
        let (mut n, mut server) = negotiator();
        server
            .write_all(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams'><stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>")
            .await
            .unwrap();
        let err = n.open_stream("nowhere.example", "en").await.unwrap_err();
        assert!(matches!(err, XmppError::StreamError(ref c) if c == "host-unknown"));
    }

    #[tokio::test]
    async fn test_negotiation_timeout() {
        let (mut n, _server) = negotiator();
        let err = n.open_stream("example.com", "en").await.unwrap_err();
        assert!(matches!(err, XmppError::Timeout));
    }

    #[tokio::test]
    async fn test_starttls_failure_reply() {
        let (mut n, mut server) = negotiator();
        server
            .write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();
        let err = n.starttls("example.com", true).await.unwrap_err();
        assert!(matches!(err, XmppError::Tls(TlsError::ServerFailure)));
    }

    #[tokio::test]
    async fn test_sasl_failure_condition() {
        let (mut n, mut server) = negotiator();
        server
            .write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/><text>bad</text></failure>")
            .await
            .unwrap();
        let features = StreamFeatures {
            mechanisms: vec!["PLAIN".to_string()],
            ..StreamFeatures::default()
        };
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
            host: "example.com".into(),
        };
        let err = n.authenticate(&features, creds).await.unwrap_err();
        assert!(matches!(err, XmppError::Sasl(SaslError::Rejected(ref c)) if c == "not-authorized"));
    }

    #[tokio::test]
    async fn test_bind_returns_jid() {
        let (mut n, mut server) = negotiator();
        server
            .write_all(b"<iq type='get' id='push1'><query xmlns='jabber:iq:version'/></iq><iq type='result' id='bind-0'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.com/phone</jid></bind></iq>")
            .await
            .unwrap();
        let jid = n.bind(Some("phone")).await.unwrap();
        assert_eq!(jid.to_string(), "alice@example.com/phone");
    }
}
