//! XMPP client engine.
//!
//! Connects to a server, secures the stream with STARTTLS, authenticates with
//! SASL (SCRAM-SHA-256, SCRAM-SHA-1, DIGEST-MD5, PLAIN), binds a resource and
//! then exchanges stanzas: `iq` requests are correlated with their replies,
//! everything else is delivered to registered listeners.

pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod jid;
pub mod sasl;
pub mod stanza;
pub mod stream;
pub mod transport;
pub mod xml;

pub use config::EngineConfig;
pub use engine::{ConnectionState, XmppEngine};
pub use error::{Result, SaslError, TlsError, XmppError};
pub use jid::Jid;
pub use stanza::{Header, Iq, IqType, Message, Presence, Stanza};
pub use xml::Element;
