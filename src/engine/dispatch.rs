//! Steady-state loops: the reader decodes and classifies, the dispatcher
//! resolves replies or raises events, in stanza order.
//!
//! A fatal condition seen by the reader travels through the same queue, so
//! every stanza received before it is delivered before the connection is
//! torn down.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use super::negotiation::{is_stream_error, stream_error_condition};
use super::Inner;
use crate::error::XmppError;
use crate::stanza::{Stanza, StanzaKind};
use crate::stream::{Frame, StreamTokenizer};
use crate::transport::{BoxedIo, READ_BUFFER_SIZE};

/// Fail the connection if this much input accumulates without completing a
/// stanza. Typical stanzas are a few KB; the largest legitimate ones (avatars,
/// archive pages) rarely exceed 100 KB.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

/// Queue item handed from the reader to the dispatcher.
pub(crate) enum Inbound {
    Stanza(Stanza),
    /// The connection is dead; nothing follows.
    Fatal(XmppError),
}

enum Step {
    Continue,
    Stop(XmppError),
}

fn classify(inner: &Inner, conn_id: u64, frame: Frame, queue: &mpsc::UnboundedSender<Inbound>) -> Step {
    let tree = match frame {
        Frame::StreamOpen(_) => {
            trace!(conn_id, "Ignoring stream header");
            return Step::Continue;
        }
        Frame::StreamClose => {
            return Step::Stop(XmppError::Disconnected("server closed the stream".to_string()));
        }
        Frame::Element(tree) => tree,
    };

    if inner.config.debug_stanzas {
        debug!(target: "fluux_xmpp::wire", conn_id, "RECV {}", tree.xml);
    }
    if is_stream_error(&tree) {
        return Step::Stop(XmppError::StreamError(stream_error_condition(&tree)));
    }
    if StanzaKind::classify(tree.local_name()).is_none() {
        debug!(conn_id, element = %tree.name, "Ignoring non-stanza element");
        return Step::Continue;
    }
    match Stanza::parse(&tree) {
        Ok(stanza) => {
            // The dispatcher is gone only while the connection is being torn down.
            let _ = queue.send(Inbound::Stanza(stanza));
        }
        Err(e) => warn!(conn_id, element = %tree.name, error = %e, "Dropping malformed stanza"),
    }
    Step::Continue
}

/// Hand a fatal error to the dispatcher, behind everything already queued.
async fn stop(inner: &Inner, conn_id: u64, queue: mpsc::UnboundedSender<Inbound>, error: XmppError) {
    if let Err(mpsc::error::SendError(Inbound::Fatal(error))) = queue.send(Inbound::Fatal(error)) {
        inner.fail(conn_id, error).await;
    }
}

/// Read from the server until the connection fails or is shut down.
pub(crate) async fn read_loop(
    inner: Arc<Inner>,
    conn_id: u64,
    mut reader: ReadHalf<BoxedIo>,
    tokenizer: StreamTokenizer,
    leftover: VecDeque<Frame>,
    queue: mpsc::UnboundedSender<Inbound>,
    mut shutdown: broadcast::Receiver<()>,
) {
    for frame in leftover {
        if let Step::Stop(e) = classify(&inner, conn_id, frame, &queue) {
            stop(&inner, conn_id, queue, e).await;
            return;
        }
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            _ = shutdown.recv() => {
                debug!(conn_id, "Reader shutting down");
                return;
            }
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                info!(conn_id, "Server closed the connection");
                let e = XmppError::Disconnected("connection closed by server".to_string());
                stop(&inner, conn_id, queue, e).await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(conn_id, error = %e, "Read failed");
                stop(&inner, conn_id, queue, XmppError::Io(e)).await;
                return;
            }
        };

        for frame in tokenizer.feed(&buf[..n]) {
            if let Step::Stop(e) = classify(&inner, conn_id, frame, &queue) {
                stop(&inner, conn_id, queue, e).await;
                return;
            }
        }

        let buffered = tokenizer.buffered_len();
        if buffered > MAX_STANZA_BUFFER_SIZE {
            warn!(conn_id, buffered, limit = MAX_STANZA_BUFFER_SIZE, "Stanza buffer exceeded limit");
            let e = XmppError::Protocol(format!("incomplete stanza exceeds {} bytes", MAX_STANZA_BUFFER_SIZE));
            stop(&inner, conn_id, queue, e).await;
            return;
        }
    }
}

/// Deliver classified stanzas until the queue closes or the connection shuts down.
pub(crate) async fn dispatch_loop(
    inner: Arc<Inner>,
    conn_id: u64,
    mut queue: mpsc::UnboundedReceiver<Inbound>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let stanza = tokio::select! {
            biased;
            item = queue.recv() => match item {
                Some(Inbound::Stanza(stanza)) => stanza,
                Some(Inbound::Fatal(e)) => {
                    inner.fail(conn_id, e).await;
                    break;
                }
                None => break,
            },
            _ = shutdown.recv() => break,
        };
        match stanza {
            Stanza::Iq(iq) => {
                if let Some(iq) = inner.correlation.resolve(iq) {
                    inner.listeners.raise_iq(&iq);
                }
            }
            Stanza::Message(m) => inner.listeners.raise_message(&m),
            Stanza::Presence(p) => inner.listeners.raise_presence(&p),
        }
    }
    debug!(conn_id, "Dispatcher stopped");
}
