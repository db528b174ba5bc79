//! Inbound XML stream handling.

pub mod framing;

pub use framing::{local_name, Frame, StanzaTree, StreamTokenizer, STREAM_TAG};
