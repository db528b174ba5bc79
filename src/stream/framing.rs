//! XMPP XML framing: incremental stanza boundary detection.
//!
//! The server side of an XMPP session is one endless XML document. Bytes
//! arrive from the socket split at arbitrary positions, so the tokenizer keeps
//! a pending buffer and an open-element stack across calls and only emits a
//! top-level element once its nesting depth returns to zero. The stream
//! wrapper (`<stream:stream>` / `</stream:stream>`) is reported on its own
//! since it never closes within the session.
//!
//! Each token is read by a `quick_xml::Reader` over the unconsumed bytes.
//! A token the reader cannot finish (unclosed tag, comment, CDATA, or text
//! that may still grow) stays in the pending buffer until more data arrives.
//! All delimiters are ASCII, so a chunk boundary inside a multi-byte UTF-8
//! sequence is harmless: tokens are only cut at ASCII positions.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::{Mutex, PoisonError};
use tracing::{trace, warn};

/// Qualified name of the stream wrapper element.
pub const STREAM_TAG: &str = "stream:stream";

/// Lexical class of a raw token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    StartTag,
    EndTag,
    /// Self-closing tag. A complete element on its own: at the top level it
    /// is emitted immediately, inside an element it does not change depth.
    EmptyTag,
    /// Character data, including CDATA sections.
    Text,
    /// XML declaration, processing instruction or DOCTYPE.
    Declaration,
    Comment,
}

/// One lexed unit, borrowed from the pending buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToken<'a> {
    pub kind: TokenKind,
    /// Qualified tag name for tag tokens, empty otherwise.
    pub name: String,
    pub raw: &'a [u8],
}

/// A complete top-level element as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaTree {
    /// Qualified name of the outermost element (e.g. `iq`, `stream:features`).
    pub name: String,
    /// Raw XML text, start tag through matching end tag.
    pub xml: String,
}

impl StanzaTree {
    /// Name without any namespace prefix.
    pub fn local_name(&self) -> &str {
        local_name(&self.name)
    }
}

/// Output of the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The peer's `<stream:stream ...>` header, raw.
    StreamOpen(String),
    /// `</stream:stream>`: the peer closed the stream.
    StreamClose,
    Element(StanzaTree),
}

/// Strip a `prefix:` from a qualified name.
pub fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

fn is_stream_tag(name: &str) -> bool {
    name == STREAM_TAG
}

/// Result of lexing at the front of the buffer.
#[derive(Debug, PartialEq, Eq)]
enum Lexed<'a> {
    Token(RawToken<'a>),
    /// Not enough data to finish the token at the front.
    Incomplete,
    /// Unrecognizable fragment of this many bytes.
    Skip(usize),
}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

fn token<'a>(kind: TokenKind, name: &[u8], raw: &'a [u8]) -> Lexed<'a> {
    Lexed::Token(RawToken {
        kind,
        name: String::from_utf8_lossy(name).into_owned(),
        raw,
    })
}

/// Skip through the next `>`, or wait for one.
fn skip_fragment(buf: &[u8]) -> Lexed<'_> {
    match buf.iter().position(|&b| b == b'>') {
        Some(end) => Lexed::Skip(end + 1),
        None => Lexed::Incomplete,
    }
}

/// Lex one token from the front of `buf`.
fn lex(buf: &[u8]) -> Lexed<'_> {
    // The reader strips a leading BOM without counting it.
    if buf.starts_with(UTF8_BOM) {
        return Lexed::Skip(UTF8_BOM.len());
    }

    let mut reader = Reader::from_reader(buf);
    let config = reader.config_mut();
    config.trim_text(false);
    // Every call starts with an empty element stack; nesting is tracked by
    // the tokenizer state instead.
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let event = reader.read_event();
    let end = (reader.buffer_position() as usize).min(buf.len());
    let raw = &buf[..end];

    match event {
        Ok(Event::Start(e)) if !e.name().as_ref().is_empty() => {
            token(TokenKind::StartTag, e.name().as_ref(), raw)
        }
        Ok(Event::Empty(e)) if !e.name().as_ref().is_empty() => {
            token(TokenKind::EmptyTag, e.name().as_ref(), raw)
        }
        Ok(Event::End(e)) if !e.name().as_ref().is_empty() => {
            token(TokenKind::EndTag, e.name().as_ref(), raw)
        }
        Ok(Event::Start(_) | Event::Empty(_) | Event::End(_)) => Lexed::Skip(raw.len()),
        // Text runs up to the next tag; without one it may still grow.
        Ok(Event::Text(_)) if end >= buf.len() => Lexed::Incomplete,
        Ok(Event::Text(_) | Event::CData(_)) => token(TokenKind::Text, b"", raw),
        Ok(Event::Comment(_)) => token(TokenKind::Comment, b"", raw),
        Ok(Event::Decl(_) | Event::PI(_) | Event::DocType(_)) => {
            token(TokenKind::Declaration, b"", raw)
        }
        Ok(Event::Eof) => Lexed::Incomplete,
        Err(quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
            | SyntaxError::UnclosedComment
            | SyntaxError::UnclosedCData
            | SyntaxError::UnclosedPIOrXmlDecl
            | SyntaxError::UnclosedDoctype,
        )) => Lexed::Incomplete,
        // `<!` alone cannot be classified yet.
        Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) if buf.len() < 3 => {
            Lexed::Incomplete
        }
        Err(e) => {
            trace!(error = %e, "Unparseable markup");
            skip_fragment(buf)
        }
    }
}

/// State machine for stanza boundary detection.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Waiting for a stanza to start (between stanzas, or before stream open).
    Idle,
    /// Inside a top-level stanza, collecting tokens.
    InStanza,
}

#[derive(Debug)]
struct TokenizerState {
    /// Bytes received but not yet lexed.
    pending: Vec<u8>,
    state: ParserState,
    /// Names of currently open elements, outermost first.
    open: Vec<String>,
    /// Raw text of the element being collected.
    current: Vec<u8>,
    root: String,
}

impl TokenizerState {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            state: ParserState::Idle,
            open: Vec::new(),
            current: Vec::new(),
            root: String::new(),
        }
    }

    fn reset_element(&mut self) {
        self.state = ParserState::Idle;
        self.open.clear();
        self.current.clear();
        self.root.clear();
    }

    fn accept(&mut self, tok: RawToken<'_>, frames: &mut Vec<Frame>) {
        match tok.kind {
            TokenKind::Declaration | TokenKind::Comment => {}
            TokenKind::Text => {
                if self.state == ParserState::InStanza {
                    self.current.extend_from_slice(tok.raw);
                } else if !tok.raw.iter().all(u8::is_ascii_whitespace) {
                    trace!(bytes = tok.raw.len(), "Discarding text outside of any element");
                }
            }
            TokenKind::StartTag | TokenKind::EmptyTag
                if self.state == ParserState::Idle && is_stream_tag(&tok.name) =>
            {
                frames.push(Frame::StreamOpen(bytes_to_string(tok.raw)));
                if tok.kind == TokenKind::EmptyTag {
                    frames.push(Frame::StreamClose);
                }
            }
            // Closes the stream unless a nested element of that name is open.
            TokenKind::EndTag
                if is_stream_tag(&tok.name) && !self.open.iter().any(|n| is_stream_tag(n)) =>
            {
                if self.state == ParserState::InStanza {
                    warn!(element = %self.root, "Stream closed inside an unfinished element");
                    self.reset_element();
                }
                frames.push(Frame::StreamClose);
            }
            TokenKind::StartTag => {
                if self.state == ParserState::Idle {
                    self.state = ParserState::InStanza;
                    self.root.clone_from(&tok.name);
                }
                self.current.extend_from_slice(tok.raw);
                self.open.push(tok.name);
            }
            TokenKind::EmptyTag => {
                if self.state == ParserState::Idle {
                    frames.push(Frame::Element(StanzaTree {
                        name: tok.name,
                        xml: bytes_to_string(tok.raw),
                    }));
                } else {
                    self.current.extend_from_slice(tok.raw);
                }
            }
            TokenKind::EndTag => {
                if self.state == ParserState::Idle {
                    trace!(name = %tok.name, "Discarding end tag without a matching start");
                    return;
                }
                if self.open.last() == Some(&tok.name) {
                    self.open.pop();
                }
                self.current.extend_from_slice(tok.raw);
                if self.open.is_empty() {
                    frames.push(Frame::Element(StanzaTree {
                        name: std::mem::take(&mut self.root),
                        xml: bytes_to_string(&self.current),
                    }));
                    self.reset_element();
                }
            }
        }
    }
}

/// Convert a byte slice to a String, trying zero-copy UTF-8 first.
fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Incremental tokenizer for the inbound XML stream.
///
/// `feed` may be called with arbitrarily split input; the same concatenated
/// input always yields the same frames regardless of chunking. State persists
/// across calls until [`StreamTokenizer::reset`] is invoked on a stream
/// restart (after STARTTLS or SASL success).
#[derive(Debug)]
pub struct StreamTokenizer {
    inner: Mutex<TokenizerState>,
}

impl Default for StreamTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTokenizer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TokenizerState::new()),
        }
    }

    /// Append a chunk and return every frame completed by it, in order.
    pub fn feed(&self, chunk: impl AsRef<[u8]>) -> Vec<Frame> {
        let mut st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        st.pending.extend_from_slice(chunk.as_ref());

        let pending = std::mem::take(&mut st.pending);
        let mut frames = Vec::new();
        let mut consumed = 0;
        loop {
            match lex(&pending[consumed..]) {
                Lexed::Incomplete => break,
                Lexed::Skip(n) => {
                    trace!(bytes = n, "Skipping unrecognized fragment");
                    consumed += n;
                }
                Lexed::Token(tok) => {
                    consumed += tok.raw.len();
                    st.accept(tok, &mut frames);
                }
            }
        }
        st.pending = pending;
        st.pending.drain(..consumed);
        frames
    }

    /// Drop all buffered input and open-element tracking.
    pub fn reset(&self) {
        let mut st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *st = TokenizerState::new();
    }

    /// Bytes held back: unlexed input plus the element being collected.
    pub fn buffered_len(&self) -> usize {
        let st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        st.pending.len() + st.current.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn elements(frames: Vec<Frame>) -> Vec<StanzaTree> {
        frames
            .into_iter()
            .filter_map(|f| match f {
                Frame::Element(tree) => Some(tree),
                _ => None,
            })
            .collect()
    }

    fn feed_all(chunks: &[&[u8]]) -> Vec<Frame> {
        let tokenizer = StreamTokenizer::new();
        chunks.iter().flat_map(|c| tokenizer.feed(c)).collect()
    }

    #[test]
    fn test_stream_opening_is_reported_immediately() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let frames = StreamTokenizer::new().feed(buf);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::StreamOpen(raw) => assert!(raw.starts_with("<stream:stream")),
            other => panic!("expected stream open, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_features_whole_element() {
        let buf = b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism></mechanisms><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let trees = elements(StreamTokenizer::new().feed(buf));
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].name, "stream:features");
        assert_eq!(trees[0].local_name(), "features");
        assert_eq!(trees[0].xml.as_bytes(), buf);
    }

    #[test]
    fn test_self_closing_top_level_stanza() {
        let trees = elements(StreamTokenizer::new().feed("<presence/>"));
        assert_eq!(trees, vec![StanzaTree { name: "presence".into(), xml: "<presence/>".into() }]);
    }

    #[test]
    fn test_multiple_stanzas_in_one_chunk() {
        let buf = "<presence from='user@example.com'/><message to='other@example.com'><body>Hello</body></message><r xmlns='urn:xmpp:sm:3'/>";
        let trees = elements(StreamTokenizer::new().feed(buf));
        let names: Vec<_> = trees.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["presence", "message", "r"]);
        assert!(trees[1].xml.contains("<body>Hello</body>"));
    }

    #[test]
    fn test_incomplete_stanza_is_held_back() {
        let tokenizer = StreamTokenizer::new();
        assert!(tokenizer.feed("<iq type='get'><query xmlns='jabber:iq:roster'>").is_empty());
        assert!(tokenizer.buffered_len() > 0);
        let trees = elements(tokenizer.feed("</query></iq>"));
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].xml, "<iq type='get'><query xmlns='jabber:iq:roster'></query></iq>");
        assert_eq!(tokenizer.buffered_len(), 0);
    }

    #[test]
    fn test_stream_closing_without_open_elements() {
        let frames = StreamTokenizer::new().feed("  </stream:stream>");
        assert_eq!(frames, vec![Frame::StreamClose]);
    }

    #[test]
    fn test_nested_same_named_children() {
        let buf = "<message><message><message/>x</message></message>";
        let tokenizer = StreamTokenizer::new();
        assert!(tokenizer.feed(&buf[..30]).is_empty());
        let trees = elements(tokenizer.feed(&buf[30..]));
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].xml, buf);
    }

    #[test]
    fn test_features_split_at_ten_and_forty() {
        let buf: &[u8] = b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>";
        let frames = feed_all(&[&buf[..10], &buf[10..40], &buf[40..]]);
        let trees = elements(frames);
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].name, "stream:features");
        assert_eq!(trees[0].xml.as_bytes(), buf);
    }

    #[test]
    fn test_declarations_comments_and_whitespace_are_dropped() {
        let frames = StreamTokenizer::new().feed("<?xml version='1.0'?>\n<!-- hi -->  <presence/>\r\n");
        assert_eq!(elements(frames).len(), 1);
    }

    #[test]
    fn test_gt_inside_attribute_value() {
        let buf = "<message id='a>b'><body>1 &gt; 0</body></message>";
        let trees = elements(StreamTokenizer::new().feed(buf));
        assert_eq!(trees[0].xml, buf);
    }

    #[test]
    fn test_cdata_kept_verbatim() {
        let buf = "<message from='a@b'><body><![CDATA[Some <raw> content & stuff]]></body></message>";
        let trees = elements(StreamTokenizer::new().feed(buf));
        assert_eq!(trees[0].xml, buf);
    }

    #[test]
    fn test_malformed_fragment_is_skipped() {
        let tokenizer = StreamTokenizer::new();
        let trees = elements(tokenizer.feed("<!bogus><presence/><></>"));
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].name, "presence");
        assert_eq!(tokenizer.buffered_len(), 0);
    }

    #[test]
    fn test_nested_stream_child_does_not_close_stream() {
        let buf = "<message from='a@b'><x xmlns='urn:example'><stream>payload</stream></x></message><presence/>";
        let frames = StreamTokenizer::new().feed(buf);
        assert!(!frames.contains(&Frame::StreamClose));
        let trees = elements(frames);
        let names: Vec<_> = trees.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["message", "presence"]);
        assert!(trees[0].xml.contains("<stream>payload</stream>"));
    }

    #[test]
    fn test_bare_stream_end_tag_is_not_a_close() {
        let frames = StreamTokenizer::new().feed("</stream><presence/>");
        assert_eq!(elements(frames.clone()).len(), 1);
        assert!(!frames.contains(&Frame::StreamClose));
    }

    #[test]
    fn test_stream_close_inside_unfinished_stanza() {
        let frames = StreamTokenizer::new().feed("<message><body>cut</stream:stream>");
        assert_eq!(frames, vec![Frame::StreamClose]);
    }

    #[test]
    fn test_partial_markup_waits_for_more_data() {
        let tokenizer = StreamTokenizer::new();
        for part in ["<", "!", "-", "- note -", "->", "<![CDATA[x", "]]>", "<pres", "ence/>"] {
            let frames = tokenizer.feed(part);
            if part == "ence/>" {
                assert_eq!(elements(frames)[0].name, "presence");
            } else {
                assert!(frames.is_empty(), "unexpected frames after {:?}", part);
            }
        }
        assert_eq!(tokenizer.buffered_len(), 0);
    }

    #[test]
    fn test_reset_forgets_partial_state() {
        let tokenizer = StreamTokenizer::new();
        tokenizer.feed("<stream:features><starttls");
        tokenizer.reset();
        assert_eq!(tokenizer.buffered_len(), 0);
        let trees = elements(tokenizer.feed("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"));
        assert_eq!(trees[0].name, "proceed");
    }

    #[test]
    fn test_split_inside_multibyte_character() {
        let buf = "<message><body>héllo wörld</body></message>".as_bytes();
        let cut = buf.iter().position(|&b| b >= 0x80).unwrap() + 1;
        let trees = elements(feed_all(&[&buf[..cut], &buf[cut..]]));
        assert_eq!(trees[0].xml, "<message><body>héllo wörld</body></message>");
    }

    #[test]
    fn test_server_header_then_features_fragmented() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='abc' version='1.0'><stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism></mechanisms></stream:features>";
        let frames = feed_all(&[&buf[..50], &buf[50..170], &buf[170..]]);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::StreamOpen(_)));
        assert!(matches!(&frames[1], Frame::Element(t) if t.name == "stream:features"));
    }

    const CORPUS: &str = "<?xml version='1.0'?><stream:stream from='example.com' version='1.0'>\
        <stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>\
        <iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@example.com/résource</jid></bind></iq> \
        <message from='alice@example.com' type='chat'><body>Hello &amp; <![CDATA[<b>]]> welcome</body></message>\
        <!-- keepalive --><presence/><iq id='x'><iq><iq/></iq></iq></stream:stream>";

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_output(cuts in proptest::collection::vec(0usize..CORPUS.len(), 0..12)) {
            let bytes = CORPUS.as_bytes();
            let whole = feed_all(&[bytes]);

            let mut cuts = cuts;
            cuts.sort_unstable();
            cuts.dedup();
            let mut chunks = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(&bytes[start..cut]);
                start = cut;
            }
            chunks.push(&bytes[start..]);

            prop_assert_eq!(feed_all(&chunks), whole);
        }
    }

    #[test]
    fn test_corpus_frames() {
        let frames = feed_all(&[CORPUS.as_bytes()]);
        let summary: Vec<String> = frames
            .iter()
            .map(|f| match f {
                Frame::StreamOpen(_) => "open".to_string(),
                Frame::StreamClose => "close".to_string(),
                Frame::Element(t) => t.name.clone(),
            })
            .collect();
        assert_eq!(summary, ["open", "stream:features", "iq", "message", "presence", "iq", "close"]);
    }
}
